//! API parse routines.
//!
//! Each routine validates one client call against the client's handles,
//! performs the bookkeeping that must happen at submission time (allocating
//! handles, recording which handles the call will modify) and describes the
//! device work to run later. The routines live in a [`ParseTable`] built once
//! per workspace.

use std::fmt;

use fxhash::FxHashMap;
use tracing::trace;
use vgpu_core::checkpoint::OpNode;
use vgpu_core::device::{StreamId, DEFAULT_STREAM};
use vgpu_core::handle::{AllocateRequest, HandleExtra, RelatedHandles, SharedHandle};
use vgpu_core::ResourceKind;
use vgpu_storage::{FunctionDesc, KernelMetaCache};

use crate::client::{Client, Effect};
use crate::error::DaemonError;

/// Identifier of a client API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ApiId {
    /// Allocate device memory.
    Malloc,
    /// Free device memory.
    Free,
    /// Host-to-device copy.
    MemcpyHtoD,
    /// Device-to-device copy.
    MemcpyDtoD,
    /// Device-to-host copy.
    MemcpyDtoH,
    /// Kernel launch.
    LaunchKernel,
    /// Load a module image.
    ModuleLoad,
    /// Look up a kernel in a module.
    GetFunction,
    /// Create a stream.
    StreamCreate,
    /// Create an event.
    EventCreate,
    /// Session teardown.
    Deinit,
}

impl ApiId {
    /// Every API with a parse routine.
    pub const ALL: [ApiId; 11] = [
        ApiId::Malloc,
        ApiId::Free,
        ApiId::MemcpyHtoD,
        ApiId::MemcpyDtoD,
        ApiId::MemcpyDtoH,
        ApiId::LaunchKernel,
        ApiId::ModuleLoad,
        ApiId::GetFunction,
        ApiId::StreamCreate,
        ApiId::EventCreate,
        ApiId::Deinit,
    ];

    /// Wire id.
    #[must_use]
    pub fn id(self) -> u64 {
        match self {
            ApiId::Malloc => 0x100,
            ApiId::Free => 0x101,
            ApiId::MemcpyHtoD => 0x110,
            ApiId::MemcpyDtoD => 0x111,
            ApiId::MemcpyDtoH => 0x112,
            ApiId::LaunchKernel => 0x200,
            ApiId::ModuleLoad => 0x300,
            ApiId::GetFunction => 0x301,
            ApiId::StreamCreate => 0x400,
            ApiId::EventCreate => 0x500,
            ApiId::Deinit => 0xf00,
        }
    }

    /// Inverse of [`id`](Self::id).
    #[must_use]
    pub fn from_id(id: u64) -> Option<Self> {
        Self::ALL.into_iter().find(|api| api.id() == id)
    }
}

impl fmt::Display for ApiId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}({:#x})", self.id())
    }
}

/// A client call with its parameters. Addresses are client addresses;
/// `stream` is a stream handle address, or 0 for the default stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiCall {
    /// Allocate `size` bytes.
    Malloc {
        /// Allocation size.
        size: u64,
    },
    /// Free the allocation starting at `addr`.
    Free {
        /// Allocation base address.
        addr: u64,
    },
    /// Copy host bytes to device memory.
    MemcpyHtoD {
        /// Destination address, may be interior.
        dst: u64,
        /// Bytes to copy.
        data: Vec<u8>,
        /// Stream.
        stream: u64,
    },
    /// Copy between device allocations.
    MemcpyDtoD {
        /// Destination address.
        dst: u64,
        /// Source address.
        src: u64,
        /// Byte count.
        len: u64,
        /// Stream.
        stream: u64,
    },
    /// Copy device memory back to the host.
    MemcpyDtoH {
        /// Source address.
        src: u64,
        /// Byte count.
        len: u64,
        /// Stream.
        stream: u64,
    },
    /// Launch a kernel.
    LaunchKernel {
        /// Function handle address.
        function: u64,
        /// Raw parameter values; pointer parameters are client addresses.
        args: Vec<u64>,
        /// Stream.
        stream: u64,
    },
    /// Load a module image.
    ModuleLoad {
        /// Module image bytes.
        image: Vec<u8>,
    },
    /// Look up a kernel by name.
    GetFunction {
        /// Module handle address.
        module: u64,
        /// Mangled kernel name.
        name: String,
    },
    /// Create a stream.
    StreamCreate {
        /// Scheduling priority.
        priority: i32,
        /// Creation flags.
        flags: u32,
    },
    /// Create an event.
    EventCreate {
        /// Creation flags.
        flags: u32,
    },
    /// End of session.
    Deinit,
}

impl ApiCall {
    /// Which API this call is.
    #[must_use]
    pub fn api(&self) -> ApiId {
        match self {
            ApiCall::Malloc { .. } => ApiId::Malloc,
            ApiCall::Free { .. } => ApiId::Free,
            ApiCall::MemcpyHtoD { .. } => ApiId::MemcpyHtoD,
            ApiCall::MemcpyDtoD { .. } => ApiId::MemcpyDtoD,
            ApiCall::MemcpyDtoH { .. } => ApiId::MemcpyDtoH,
            ApiCall::LaunchKernel { .. } => ApiId::LaunchKernel,
            ApiCall::ModuleLoad { .. } => ApiId::ModuleLoad,
            ApiCall::GetFunction { .. } => ApiId::GetFunction,
            ApiCall::StreamCreate { .. } => ApiId::StreamCreate,
            ApiCall::EventCreate { .. } => ApiId::EventCreate,
            ApiCall::Deinit => ApiId::Deinit,
        }
    }
}

/// What a parse routine produced.
#[derive(Debug)]
pub struct ParsedOp {
    /// Node to queue.
    pub node: OpNode,
    /// Work to do when the node runs.
    pub effect: Effect,
    /// Value returned to the client immediately, e.g. a new address.
    pub result: Option<u64>,
}

/// Inputs a parse routine may consult.
#[derive(Debug, Clone, Copy)]
pub struct ParseContext<'a> {
    /// Calling client.
    pub client: &'a Client,
    /// Kernel parameter layouts.
    pub kernel_meta: &'a KernelMetaCache,
}

impl ParseContext<'_> {
    fn node(&self, api: ApiId, stream: StreamId) -> OpNode {
        OpNode::api(self.client.id(), api.id()).on_stream(stream)
    }

    fn stream(&self, addr: u64) -> Result<StreamId, DaemonError> {
        if addr == 0 {
            return Ok(DEFAULT_STREAM);
        }
        let (handle, offset) = self.client.resolve_addr(ResourceKind::Stream, addr)?;
        if offset != 0 {
            return Err(DaemonError::InvalidCall(format!("{addr:#x} is not a stream handle")));
        }
        let id = handle.lock().id();
        Ok(id.0)
    }

    fn context(&self) -> Result<RelatedHandles, DaemonError> {
        let ctx = self
            .client
            .managers()
            .primary(ResourceKind::Context)
            .ok_or_else(|| DaemonError::InvalidCall("client has no active context".into()))?;
        Ok(RelatedHandles::new().with(ResourceKind::Context, ctx))
    }

    fn allocate(&self, kind: ResourceKind, related: &RelatedHandles, request: AllocateRequest) -> Result<SharedHandle, DaemonError> {
        Ok(self
            .client
            .managers()
            .require_manager(kind)?
            .allocate_mocked_resource(related, request)?)
    }

    fn mark_modified(&self, handle: &SharedHandle) -> Result<(), DaemonError> {
        let (kind, id) = {
            let h = handle.lock();
            (h.kind(), h.id())
        };
        self.client.managers().require_manager(kind)?.mark_modified(id)?;
        Ok(())
    }
}

/// A parse routine.
pub type ParseFn = fn(&ParseContext<'_>, &ApiCall) -> Result<ParsedOp, DaemonError>;

/// Immutable `ApiId → routine` map.
#[derive(Debug)]
pub struct ParseTable {
    routines: FxHashMap<ApiId, ParseFn>,
}

impl Default for ParseTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ParseTable {
    /// Table with every built-in routine.
    #[must_use]
    pub fn new() -> Self {
        let entries: [(ApiId, ParseFn); 11] = [
            (ApiId::Malloc, parse_malloc),
            (ApiId::Free, parse_free),
            (ApiId::MemcpyHtoD, parse_memcpy_htod),
            (ApiId::MemcpyDtoD, parse_memcpy_dtod),
            (ApiId::MemcpyDtoH, parse_memcpy_dtoh),
            (ApiId::LaunchKernel, parse_launch_kernel),
            (ApiId::ModuleLoad, parse_module_load),
            (ApiId::GetFunction, parse_get_function),
            (ApiId::StreamCreate, parse_stream_create),
            (ApiId::EventCreate, parse_event_create),
            (ApiId::Deinit, parse_deinit),
        ];
        Self {
            routines: entries.into_iter().collect(),
        }
    }

    /// Number of routines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.routines.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routines.is_empty()
    }

    /// Routine for `api`.
    #[must_use]
    pub fn get(&self, api: ApiId) -> Option<ParseFn> {
        self.routines.get(&api).copied()
    }

    /// Parse `call`.
    ///
    /// # Errors
    ///
    /// [`DaemonError::UnknownApi`] when no routine is registered, otherwise
    /// whatever the routine returns.
    pub fn parse(&self, ctx: &ParseContext<'_>, call: &ApiCall) -> Result<ParsedOp, DaemonError> {
        let api = call.api();
        let routine = self.get(api).ok_or(DaemonError::UnknownApi(api.id()))?;
        trace!(client_id = ctx.client.id(), %api, "parsing call");
        routine(ctx, call)
    }
}

fn mismatch(expected: ApiId, call: &ApiCall) -> DaemonError {
    DaemonError::InvalidCall(format!("{expected} routine handed a {} call", call.api()))
}

fn parse_malloc(ctx: &ParseContext<'_>, call: &ApiCall) -> Result<ParsedOp, DaemonError> {
    let ApiCall::Malloc { size } = call else {
        return Err(mismatch(ApiId::Malloc, call));
    };
    if *size == 0 {
        return Err(DaemonError::InvalidCall("zero-byte allocation".into()));
    }
    let handle = ctx.allocate(ResourceKind::Memory, &ctx.context()?, AllocateRequest::stateful(*size))?;
    // A fresh buffer has no snapshot yet; capture it so it can be restored.
    ctx.mark_modified(&handle)?;
    let addr = handle.lock().client_addr();
    Ok(ParsedOp {
        node: ctx.node(ApiId::Malloc, DEFAULT_STREAM),
        effect: Effect::None,
        result: Some(addr),
    })
}

fn parse_free(ctx: &ParseContext<'_>, call: &ApiCall) -> Result<ParsedOp, DaemonError> {
    let ApiCall::Free { addr } = call else {
        return Err(mismatch(ApiId::Free, call));
    };
    let (handle, offset) = ctx.client.resolve_addr(ResourceKind::Memory, *addr)?;
    if offset != 0 {
        return Err(DaemonError::InvalidCall(format!("{addr:#x} is not an allocation base")));
    }
    let handle = handle.lock().handle_ref();
    Ok(ParsedOp {
        node: ctx.node(ApiId::Free, DEFAULT_STREAM),
        effect: Effect::TearDown(handle),
        result: None,
    })
}

fn parse_memcpy_htod(ctx: &ParseContext<'_>, call: &ApiCall) -> Result<ParsedOp, DaemonError> {
    let ApiCall::MemcpyHtoD { dst, data, stream } = call else {
        return Err(mismatch(ApiId::MemcpyHtoD, call));
    };
    let stream = ctx.stream(*stream)?;
    let (handle, offset) = ctx.client.resolve_addr(ResourceKind::Memory, *dst)?;
    ctx.mark_modified(&handle)?;
    let handle = handle.lock().handle_ref();
    Ok(ParsedOp {
        node: ctx.node(ApiId::MemcpyHtoD, stream),
        effect: Effect::Write {
            handle,
            offset,
            data: data.clone(),
        },
        result: None,
    })
}

fn parse_memcpy_dtod(ctx: &ParseContext<'_>, call: &ApiCall) -> Result<ParsedOp, DaemonError> {
    let ApiCall::MemcpyDtoD { dst, src, len, stream } = call else {
        return Err(mismatch(ApiId::MemcpyDtoD, call));
    };
    let stream = ctx.stream(*stream)?;
    let (dst_handle, dst_offset) = ctx.client.resolve_addr(ResourceKind::Memory, *dst)?;
    let (src_handle, src_offset) = ctx.client.resolve_addr(ResourceKind::Memory, *src)?;
    ctx.mark_modified(&dst_handle)?;
    let dst = dst_handle.lock().handle_ref();
    let src = src_handle.lock().handle_ref();
    Ok(ParsedOp {
        node: ctx.node(ApiId::MemcpyDtoD, stream),
        effect: Effect::Copy {
            dst,
            dst_offset,
            src,
            src_offset,
            len: *len,
        },
        result: None,
    })
}

fn parse_memcpy_dtoh(ctx: &ParseContext<'_>, call: &ApiCall) -> Result<ParsedOp, DaemonError> {
    let ApiCall::MemcpyDtoH { src, len, stream } = call else {
        return Err(mismatch(ApiId::MemcpyDtoH, call));
    };
    let stream = ctx.stream(*stream)?;
    let (handle, offset) = ctx.client.resolve_addr(ResourceKind::Memory, *src)?;
    let handle = handle.lock().handle_ref();
    Ok(ParsedOp {
        node: ctx.node(ApiId::MemcpyDtoH, stream),
        effect: Effect::Read {
            handle,
            offset,
            len: *len,
        },
        result: None,
    })
}

fn parse_launch_kernel(ctx: &ParseContext<'_>, call: &ApiCall) -> Result<ParsedOp, DaemonError> {
    let ApiCall::LaunchKernel { function, args, stream } = call else {
        return Err(mismatch(ApiId::LaunchKernel, call));
    };
    let stream = ctx.stream(*stream)?;
    let (function, _) = ctx.client.resolve_addr(ResourceKind::Function, *function)?;
    let name = match function.lock().extra() {
        HandleExtra::Function { name } => name.clone(),
        other => {
            return Err(DaemonError::InvalidCall(format!(
                "function handle carries {other:?}"
            )))
        }
    };

    let memory = ctx.client.managers().require_manager(ResourceKind::Memory)?;
    let written: Vec<u64> = match ctx.kernel_meta.get(&name) {
        Some(desc) => written_args(desc, args)?,
        // Without a layout every argument that lands in an allocation is
        // assumed to be an inout pointer.
        None => args.clone(),
    };
    let mut marked = 0usize;
    for value in written {
        if let Some((handle, _)) = memory.get_by_client_addr(value) {
            ctx.mark_modified(&handle)?;
            marked += 1;
        }
    }
    trace!(kernel = %name, marked, "kernel launch parsed");
    Ok(ParsedOp {
        node: ctx.node(ApiId::LaunchKernel, stream),
        effect: Effect::None,
        result: None,
    })
}

fn written_args(desc: &FunctionDesc, args: &[u64]) -> Result<Vec<u64>, DaemonError> {
    if args.len() != desc.nb_params() {
        return Err(DaemonError::InvalidCall(format!(
            "{} takes {} params, got {}",
            desc.name,
            desc.nb_params(),
            args.len()
        )));
    }
    Ok(desc
        .written_params()
        .filter_map(|index| args.get(index as usize).copied())
        .collect())
}

fn parse_module_load(ctx: &ParseContext<'_>, call: &ApiCall) -> Result<ParsedOp, DaemonError> {
    let ApiCall::ModuleLoad { image } = call else {
        return Err(mismatch(ApiId::ModuleLoad, call));
    };
    if image.is_empty() {
        return Err(DaemonError::InvalidCall("empty module image".into()));
    }
    let handle = ctx.allocate(
        ResourceKind::Module,
        &ctx.context()?,
        AllocateRequest::stateful(image.len() as u64),
    )?;
    ctx.mark_modified(&handle)?;
    let (handle_ref, addr) = {
        let h = handle.lock();
        (h.handle_ref(), h.client_addr())
    };
    Ok(ParsedOp {
        node: ctx.node(ApiId::ModuleLoad, DEFAULT_STREAM),
        effect: Effect::Write {
            handle: handle_ref,
            offset: 0,
            data: image.clone(),
        },
        result: Some(addr),
    })
}

fn parse_get_function(ctx: &ParseContext<'_>, call: &ApiCall) -> Result<ParsedOp, DaemonError> {
    let ApiCall::GetFunction { module, name } = call else {
        return Err(mismatch(ApiId::GetFunction, call));
    };
    let (module, _) = ctx.client.resolve_addr(ResourceKind::Module, *module)?;
    let related = RelatedHandles::new().with(ResourceKind::Module, module);
    let handle = ctx.allocate(
        ResourceKind::Function,
        &related,
        AllocateRequest::object().with_extra(HandleExtra::Function { name: name.clone() }),
    )?;
    let addr = handle.lock().client_addr();
    Ok(ParsedOp {
        node: ctx.node(ApiId::GetFunction, DEFAULT_STREAM),
        effect: Effect::None,
        result: Some(addr),
    })
}

fn parse_stream_create(ctx: &ParseContext<'_>, call: &ApiCall) -> Result<ParsedOp, DaemonError> {
    let ApiCall::StreamCreate { priority, flags } = call else {
        return Err(mismatch(ApiId::StreamCreate, call));
    };
    let handle = ctx.allocate(
        ResourceKind::Stream,
        &ctx.context()?,
        AllocateRequest::object().with_extra(HandleExtra::Stream {
            priority: *priority,
            flags: *flags,
        }),
    )?;
    let addr = handle.lock().client_addr();
    Ok(ParsedOp {
        node: ctx.node(ApiId::StreamCreate, DEFAULT_STREAM),
        effect: Effect::None,
        result: Some(addr),
    })
}

fn parse_event_create(ctx: &ParseContext<'_>, call: &ApiCall) -> Result<ParsedOp, DaemonError> {
    let ApiCall::EventCreate { flags } = call else {
        return Err(mismatch(ApiId::EventCreate, call));
    };
    let handle = ctx.allocate(
        ResourceKind::Event,
        &ctx.context()?,
        AllocateRequest::object().with_extra(HandleExtra::Event { flags: *flags }),
    )?;
    let addr = handle.lock().client_addr();
    Ok(ParsedOp {
        node: ctx.node(ApiId::EventCreate, DEFAULT_STREAM),
        effect: Effect::None,
        result: Some(addr),
    })
}

fn parse_deinit(ctx: &ParseContext<'_>, call: &ApiCall) -> Result<ParsedOp, DaemonError> {
    if !matches!(call, ApiCall::Deinit) {
        return Err(mismatch(ApiId::Deinit, call));
    }
    Ok(ParsedOp {
        node: ctx.node(ApiId::Deinit, DEFAULT_STREAM),
        effect: Effect::None,
        result: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use vgpu_core::device::SimulatedDevice;

    fn client() -> Client {
        Client::new(1, Arc::new(SimulatedDevice::new(0, 1 << 20)), 64, false).unwrap()
    }

    #[test]
    fn test_api_ids_roundtrip() {
        for api in ApiId::ALL {
            assert_eq!(ApiId::from_id(api.id()), Some(api));
        }
        assert_eq!(ApiId::from_id(0xdead), None);
        assert_eq!(ParseTable::new().len(), ApiId::ALL.len());
    }

    #[test]
    fn test_malloc_marks_new_buffer() {
        let client = client();
        let meta = KernelMetaCache::new();
        let ctx = ParseContext {
            client: &client,
            kernel_meta: &meta,
        };
        let parsed = ParseTable::new().parse(&ctx, &ApiCall::Malloc { size: 128 }).unwrap();
        let addr = parsed.result.unwrap();
        let (handle, offset) = client.resolve_addr(ResourceKind::Memory, addr + 16).unwrap();
        assert_eq!(offset, 16);
        let mem = client.managers().manager(ResourceKind::Memory).unwrap();
        assert_eq!(mem.get_modified_handles(), vec![handle.lock().id()]);
    }

    #[test]
    fn test_routine_rejects_other_call() {
        let client = client();
        let meta = KernelMetaCache::new();
        let ctx = ParseContext {
            client: &client,
            kernel_meta: &meta,
        };
        assert!(matches!(
            parse_free(&ctx, &ApiCall::Deinit),
            Err(DaemonError::InvalidCall(_))
        ));
        assert!(matches!(
            ParseTable::new().parse(&ctx, &ApiCall::Free { addr: 0x42 }),
            Err(DaemonError::InvalidCall(_))
        ));
    }

    #[test]
    fn test_kernel_launch_uses_cached_layout() {
        let client = client();
        let table = ParseTable::new();
        let mut meta = KernelMetaCache::new();
        meta.insert(FunctionDesc::parse_line("axpy|axpy(float*, float*)|2|0|8|8|8|1|0|1|1|0|0|0|0").unwrap());
        let empty = KernelMetaCache::new();

        let ctx = ParseContext {
            client: &client,
            kernel_meta: &meta,
        };
        let x = table.parse(&ctx, &ApiCall::Malloc { size: 64 }).unwrap().result.unwrap();
        let y = table.parse(&ctx, &ApiCall::Malloc { size: 64 }).unwrap().result.unwrap();
        let module = table
            .parse(&ctx, &ApiCall::ModuleLoad { image: vec![1, 2, 3] })
            .unwrap()
            .result
            .unwrap();
        let function = table
            .parse(
                &ctx,
                &ApiCall::GetFunction {
                    module,
                    name: "axpy".into(),
                },
            )
            .unwrap()
            .result
            .unwrap();

        let mem = client.managers().manager(ResourceKind::Memory).unwrap();
        let id_of = |addr| client.resolve_addr(ResourceKind::Memory, addr).unwrap().0.lock().id();
        mem.clear_modified_handles();

        let launch = ApiCall::LaunchKernel {
            function,
            args: vec![x, y],
            stream: 0,
        };
        table.parse(&ctx, &launch).unwrap();
        assert_eq!(mem.take_modified_handles(), vec![id_of(y)]);

        let cold = ParseContext {
            client: &client,
            kernel_meta: &empty,
        };
        table.parse(&cold, &launch).unwrap();
        let mut both = vec![id_of(x), id_of(y)];
        both.sort();
        let mut marked = mem.take_modified_handles();
        marked.sort();
        assert_eq!(marked, both);
    }
}
