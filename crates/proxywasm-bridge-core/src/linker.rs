//! Host import registration for the guest linker.
//!
//! Every proxy-wasm import is a thin shim: decode arguments from guest
//! memory, dispatch to the capability handler currently installed in
//! [`HostState`], encode the answer back into guest memory, and return a
//! [`WasmResult`](crate::abi::WasmResult) code. Capability failures never trap the guest.

use tracing::{debug, warn};
use wasmtime::{Caller, Extern, ExternType, Linker, Memory, Module, Store, Val, ValType};

use crate::abi::{LogLevel, MapType, deserialize_pairs, serialize_pairs, status_of};
use crate::handler::HostResult;
use crate::store::HostState;
use proxywasm_bridge_common::{HostFunctionError, RuntimeError};

/// Guest exports tried, in order, to allocate host-to-guest buffers.
const ALLOCATORS: [&str; 2] = ["proxy_on_memory_allocate", "malloc"];

/// Register all host imports on a guest linker.
///
/// This registers WASI preview1 and the proxy-wasm `env` imports.
///
/// # Errors
///
/// Returns an error if any import is already defined on the linker.
pub fn register_all(linker: &mut Linker<HostState>) -> Result<(), RuntimeError> {
    wasmtime_wasi::preview1::add_to_linker_sync(linker, |state: &mut HostState| &mut state.wasi)
        .map_err(|e| registration_failed("wasi_snapshot_preview1", &e))?;

    register_logging(linker)?;
    register_header_maps(linker)?;
    register_misc(linker)?;
    Ok(())
}

/// Answer `env` imports the bridge does not provide with `Unimplemented`.
///
/// Only functions returning a single `i32` status qualify; any other
/// unresolved import is left for the caller to handle.
pub fn define_unimplemented(
    linker: &mut Linker<HostState>,
    store: &mut Store<HostState>,
    module: &Module,
) -> Result<(), RuntimeError> {
    for import in module.imports() {
        if import.module() != "env" {
            continue;
        }
        let ExternType::Func(ty) = import.ty() else {
            continue;
        };
        let mut results = ty.results();
        let returns_status = matches!(results.next(), Some(ValType::I32)) && results.next().is_none();
        if !returns_status || linker.get(&mut *store, "env", import.name()).is_some() {
            continue;
        }

        let name = import.name().to_string();
        debug!(import = %name, "Import not provided, answering Unimplemented");
        linker
            .func_new("env", import.name(), ty.clone(), move |_caller, _params, out| {
                let result: HostResult<()> =
                    Err(HostFunctionError::unimplemented("unregistered env import"));
                out[0] = Val::I32(finish(&name, &result));
                Ok(())
            })
            .map_err(|e| registration_failed(import.name(), &e))?;
    }
    Ok(())
}

/// Register `proxy_log` and `proxy_get_log_level`.
///
/// # Memory Protocol
///
/// The guest passes:
/// - `level`: Log level (0=trace .. 5=critical)
/// - `ptr`: Pointer to the message in guest memory
/// - `len`: Length of the message in bytes (UTF-8)
pub fn register_logging(linker: &mut Linker<HostState>) -> Result<(), RuntimeError> {
    linker
        .func_wrap(
            "env",
            "proxy_log",
            |mut caller: Caller<'_, HostState>, level: i32, ptr: i32, len: i32| -> i32 {
                finish("proxy_log", &log(&mut caller, level, ptr, len))
            },
        )
        .map_err(|e| registration_failed("proxy_log", &e))?;

    linker
        .func_wrap(
            "env",
            "proxy_get_log_level",
            |mut caller: Caller<'_, HostState>, ret_level: i32| -> i32 {
                finish("proxy_get_log_level", &get_log_level(&mut caller, ret_level))
            },
        )
        .map_err(|e| registration_failed("proxy_get_log_level", &e))?;

    Ok(())
}

/// Register the header map imports.
pub fn register_header_maps(linker: &mut Linker<HostState>) -> Result<(), RuntimeError> {
    linker
        .func_wrap(
            "env",
            "proxy_get_header_map_value",
            |mut caller: Caller<'_, HostState>,
             map_type: i32,
             key_ptr: i32,
             key_len: i32,
             ret_ptr: i32,
             ret_len: i32|
             -> i32 {
                let result =
                    get_header_map_value(&mut caller, map_type, (key_ptr, key_len), (ret_ptr, ret_len));
                finish("proxy_get_header_map_value", &result)
            },
        )
        .map_err(|e| registration_failed("proxy_get_header_map_value", &e))?;

    linker
        .func_wrap(
            "env",
            "proxy_get_header_map_pairs",
            |mut caller: Caller<'_, HostState>, map_type: i32, ret_ptr: i32, ret_len: i32| -> i32 {
                let result = get_header_map_pairs(&mut caller, map_type, (ret_ptr, ret_len));
                finish("proxy_get_header_map_pairs", &result)
            },
        )
        .map_err(|e| registration_failed("proxy_get_header_map_pairs", &e))?;

    linker
        .func_wrap(
            "env",
            "proxy_add_header_map_value",
            |mut caller: Caller<'_, HostState>,
             map_type: i32,
             key_ptr: i32,
             key_len: i32,
             value_ptr: i32,
             value_len: i32|
             -> i32 {
                let result = write_header_map_value(
                    &mut caller,
                    HeaderWrite::Add,
                    map_type,
                    (key_ptr, key_len),
                    (value_ptr, value_len),
                );
                finish("proxy_add_header_map_value", &result)
            },
        )
        .map_err(|e| registration_failed("proxy_add_header_map_value", &e))?;

    linker
        .func_wrap(
            "env",
            "proxy_replace_header_map_value",
            |mut caller: Caller<'_, HostState>,
             map_type: i32,
             key_ptr: i32,
             key_len: i32,
             value_ptr: i32,
             value_len: i32|
             -> i32 {
                let result = write_header_map_value(
                    &mut caller,
                    HeaderWrite::Replace,
                    map_type,
                    (key_ptr, key_len),
                    (value_ptr, value_len),
                );
                finish("proxy_replace_header_map_value", &result)
            },
        )
        .map_err(|e| registration_failed("proxy_replace_header_map_value", &e))?;

    linker
        .func_wrap(
            "env",
            "proxy_remove_header_map_value",
            |mut caller: Caller<'_, HostState>, map_type: i32, key_ptr: i32, key_len: i32| -> i32 {
                let result = remove_header_map_value(&mut caller, map_type, (key_ptr, key_len));
                finish("proxy_remove_header_map_value", &result)
            },
        )
        .map_err(|e| registration_failed("proxy_remove_header_map_value", &e))?;

    linker
        .func_wrap(
            "env",
            "proxy_get_header_map_size",
            |mut caller: Caller<'_, HostState>, map_type: i32, ret_size: i32| -> i32 {
                let result = get_header_map_size(&mut caller, map_type, ret_size);
                finish("proxy_get_header_map_size", &result)
            },
        )
        .map_err(|e| registration_failed("proxy_get_header_map_size", &e))?;

    Ok(())
}

/// Register clock, property, local response and context imports.
pub fn register_misc(linker: &mut Linker<HostState>) -> Result<(), RuntimeError> {
    linker
        .func_wrap(
            "env",
            "proxy_get_current_time_nanoseconds",
            |mut caller: Caller<'_, HostState>, ret_time: i32| -> i32 {
                let now = caller.data_mut().handler_mut().current_time_nanos();
                let result = now.and_then(|now| write_bytes(&mut caller, ret_time, &now.to_le_bytes()));
                finish("proxy_get_current_time_nanoseconds", &result)
            },
        )
        .map_err(|e| registration_failed("proxy_get_current_time_nanoseconds", &e))?;

    linker
        .func_wrap(
            "env",
            "proxy_get_property",
            |mut caller: Caller<'_, HostState>,
             path_ptr: i32,
             path_len: i32,
             ret_ptr: i32,
             ret_len: i32|
             -> i32 {
                let result = get_property(&mut caller, (path_ptr, path_len), (ret_ptr, ret_len));
                finish("proxy_get_property", &result)
            },
        )
        .map_err(|e| registration_failed("proxy_get_property", &e))?;

    linker
        .func_wrap(
            "env",
            "proxy_set_property",
            |mut caller: Caller<'_, HostState>,
             path_ptr: i32,
             path_len: i32,
             value_ptr: i32,
             value_len: i32|
             -> i32 {
                let result = set_property(&mut caller, (path_ptr, path_len), (value_ptr, value_len));
                finish("proxy_set_property", &result)
            },
        )
        .map_err(|e| registration_failed("proxy_set_property", &e))?;

    linker
        .func_wrap(
            "env",
            "proxy_send_local_response",
            |mut caller: Caller<'_, HostState>,
             status: i32,
             details_ptr: i32,
             details_len: i32,
             body_ptr: i32,
             body_len: i32,
             headers_ptr: i32,
             headers_len: i32,
             _grpc_status: i32|
             -> i32 {
                let result = send_local_response(
                    &mut caller,
                    status,
                    (details_ptr, details_len),
                    (body_ptr, body_len),
                    (headers_ptr, headers_len),
                );
                finish("proxy_send_local_response", &result)
            },
        )
        .map_err(|e| registration_failed("proxy_send_local_response", &e))?;

    linker
        .func_wrap(
            "env",
            "proxy_set_effective_context",
            |mut caller: Caller<'_, HostState>, context_id: i32| -> i32 {
                let result = caller
                    .data_mut()
                    .handler_mut()
                    .set_effective_context(context_id);
                finish("proxy_set_effective_context", &result)
            },
        )
        .map_err(|e| registration_failed("proxy_set_effective_context", &e))?;

    linker
        .func_wrap(
            "env",
            "proxy_done",
            |mut caller: Caller<'_, HostState>| -> i32 {
                let result = caller.data_mut().handler_mut().done();
                finish("proxy_done", &result)
            },
        )
        .map_err(|e| registration_failed("proxy_done", &e))?;

    Ok(())
}

/// Guest pointer and length pair.
type GuestSlice = (i32, i32);

#[derive(Debug, Clone, Copy)]
enum HeaderWrite {
    Add,
    Replace,
}

fn log(caller: &mut Caller<'_, HostState>, level: i32, ptr: i32, len: i32) -> HostResult<()> {
    let message = read_string(caller, (ptr, len))?;
    caller
        .data_mut()
        .handler_mut()
        .log(LogLevel::from_i32(level), &message)
}

#[allow(clippy::cast_sign_loss)]
fn get_log_level(caller: &mut Caller<'_, HostState>, ret_level: i32) -> HostResult<()> {
    let level = caller.data_mut().handler_mut().log_level()?;
    write_bytes(caller, ret_level, &(level.as_i32() as u32).to_le_bytes())
}

fn get_header_map_value(
    caller: &mut Caller<'_, HostState>,
    map_type: i32,
    key: GuestSlice,
    ret: GuestSlice,
) -> HostResult<()> {
    let map_type = parse_map_type(map_type)?;
    let key = read_string(caller, key)?;
    let value = caller
        .data_mut()
        .handler_mut()
        .header_map(map_type)?
        .get(&key)
        .ok_or_else(|| HostFunctionError::not_found(key))?;

    copy_to_guest(caller, value.as_bytes(), ret)
}

fn get_header_map_pairs(
    caller: &mut Caller<'_, HostState>,
    map_type: i32,
    ret: GuestSlice,
) -> HostResult<()> {
    let map_type = parse_map_type(map_type)?;
    let pairs = caller.data_mut().handler_mut().header_map(map_type)?.pairs();

    copy_to_guest(caller, &serialize_pairs(&pairs), ret)
}

fn write_header_map_value(
    caller: &mut Caller<'_, HostState>,
    op: HeaderWrite,
    map_type: i32,
    key: GuestSlice,
    value: GuestSlice,
) -> HostResult<()> {
    let map_type = parse_map_type(map_type)?;
    let key = read_string(caller, key)?;
    let value = read_string(caller, value)?;
    let map = caller.data_mut().handler_mut().header_map(map_type)?;

    match op {
        HeaderWrite::Add => map.add(&key, &value)?,
        HeaderWrite::Replace => map.set(&key, &value)?,
    }
    Ok(())
}

fn remove_header_map_value(
    caller: &mut Caller<'_, HostState>,
    map_type: i32,
    key: GuestSlice,
) -> HostResult<()> {
    let map_type = parse_map_type(map_type)?;
    let key = read_string(caller, key)?;
    caller
        .data_mut()
        .handler_mut()
        .header_map(map_type)?
        .del(&key)?;
    Ok(())
}

fn get_header_map_size(
    caller: &mut Caller<'_, HostState>,
    map_type: i32,
    ret_size: i32,
) -> HostResult<()> {
    let map_type = parse_map_type(map_type)?;
    let size = caller
        .data_mut()
        .handler_mut()
        .header_map(map_type)?
        .byte_size()?;
    let size = u32::try_from(size)
        .map_err(|_| HostFunctionError::invalid_argument("header map size exceeds u32"))?;

    write_bytes(caller, ret_size, &size.to_le_bytes())
}

fn get_property(
    caller: &mut Caller<'_, HostState>,
    path: GuestSlice,
    ret: GuestSlice,
) -> HostResult<()> {
    let path = split_path(&read_bytes(caller, path)?)?;
    let value = caller.data_mut().handler_mut().get_property(&path)?;

    copy_to_guest(caller, &value, ret)
}

fn set_property(
    caller: &mut Caller<'_, HostState>,
    path: GuestSlice,
    value: GuestSlice,
) -> HostResult<()> {
    let path = split_path(&read_bytes(caller, path)?)?;
    let value = read_bytes(caller, value)?;

    caller.data_mut().handler_mut().set_property(&path, &value)
}

fn send_local_response(
    caller: &mut Caller<'_, HostState>,
    status: i32,
    details: GuestSlice,
    body: GuestSlice,
    headers: GuestSlice,
) -> HostResult<()> {
    let status = u32::try_from(status)
        .map_err(|_| HostFunctionError::invalid_argument(format!("status code {status}")))?;
    let details = read_string(caller, details)?;
    let body = read_bytes(caller, body)?;
    let headers = read_bytes(caller, headers)?;
    let headers = if headers.is_empty() {
        Vec::new()
    } else {
        deserialize_pairs(&headers)
            .ok_or_else(|| HostFunctionError::invalid_argument("malformed header pairs"))?
    };

    caller
        .data_mut()
        .handler_mut()
        .send_local_response(status, &details, &body, headers)
}

fn parse_map_type(raw: i32) -> HostResult<MapType> {
    MapType::from_i32(raw)
        .ok_or_else(|| HostFunctionError::invalid_argument(format!("unknown map type {raw}")))
}

/// Property paths are NUL-separated segments.
fn split_path(raw: &[u8]) -> HostResult<Vec<String>> {
    raw.split(|b| *b == 0)
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            String::from_utf8(segment.to_vec())
                .map_err(|_| HostFunctionError::invalid_argument("property path is not UTF-8"))
        })
        .collect()
}

fn guest_memory(caller: &mut Caller<'_, HostState>) -> HostResult<Memory> {
    caller
        .get_export("memory")
        .and_then(Extern::into_memory)
        .ok_or_else(|| HostFunctionError::Internal {
            reason: "memory export not found in guest module".into(),
        })
}

#[allow(clippy::cast_sign_loss)]
fn read_bytes(caller: &mut Caller<'_, HostState>, (ptr, len): GuestSlice) -> HostResult<Vec<u8>> {
    if ptr < 0 || len < 0 {
        return Err(HostFunctionError::InvalidMemoryAccess { ptr, len });
    }

    let memory = guest_memory(caller)?;
    let start = ptr as usize;
    memory
        .data(&*caller)
        .get(start..start.saturating_add(len as usize))
        .map(<[u8]>::to_vec)
        .ok_or(HostFunctionError::InvalidMemoryAccess { ptr, len })
}

fn read_string(caller: &mut Caller<'_, HostState>, slice: GuestSlice) -> HostResult<String> {
    String::from_utf8(read_bytes(caller, slice)?)
        .map_err(|_| HostFunctionError::invalid_argument("string is not UTF-8"))
}

#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
fn write_bytes(caller: &mut Caller<'_, HostState>, ptr: i32, bytes: &[u8]) -> HostResult<()> {
    let invalid = HostFunctionError::InvalidMemoryAccess {
        ptr,
        len: bytes.len() as i32,
    };
    if ptr < 0 {
        return Err(invalid);
    }

    let memory = guest_memory(caller)?;
    memory
        .write(&mut *caller, ptr as usize, bytes)
        .map_err(|_| invalid)
}

/// Allocate a buffer inside the guest through its exported allocator.
fn allocate(caller: &mut Caller<'_, HostState>, size: usize) -> HostResult<i32> {
    let size = i32::try_from(size)
        .map_err(|_| HostFunctionError::invalid_argument("buffer exceeds guest address space"))?;

    let func = ALLOCATORS
        .iter()
        .find_map(|name| caller.get_export(name).and_then(Extern::into_func))
        .ok_or_else(|| HostFunctionError::Internal {
            reason: "guest exports no allocator".into(),
        })?;
    let func = func
        .typed::<i32, i32>(&*caller)
        .map_err(|e| HostFunctionError::Internal {
            reason: format!("guest allocator has wrong signature: {e}"),
        })?;

    let ptr = func
        .call(&mut *caller, size)
        .map_err(|e| HostFunctionError::Internal {
            reason: format!("guest allocator failed: {e}"),
        })?;
    if ptr <= 0 {
        return Err(HostFunctionError::Internal {
            reason: "guest allocator returned null".into(),
        });
    }

    Ok(ptr)
}

/// Copy `bytes` into a fresh guest buffer and report it through the
/// guest's return slots. Empty values are reported as a null buffer.
#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
fn copy_to_guest(
    caller: &mut Caller<'_, HostState>,
    bytes: &[u8],
    (ret_ptr, ret_len): GuestSlice,
) -> HostResult<()> {
    let ptr = if bytes.is_empty() {
        0
    } else {
        let ptr = allocate(caller, bytes.len())?;
        write_bytes(caller, ptr, bytes)?;
        ptr
    };

    write_bytes(caller, ret_ptr, &(ptr as u32).to_le_bytes())?;
    write_bytes(caller, ret_len, &(bytes.len() as u32).to_le_bytes())
}

fn finish<T>(import: &str, result: &HostResult<T>) -> i32 {
    match result {
        Ok(_) => {}
        Err(err @ HostFunctionError::Internal { .. }) => {
            warn!(import, error = %err, "Host import failed");
        }
        Err(err) => debug!(import, error = %err, "Host import declined"),
    }
    status_of(result).as_i32()
}

fn registration_failed(import: &str, err: &wasmtime::Error) -> RuntimeError {
    RuntimeError::invalid_config(format!("Failed to register {import}: {err}"))
}
