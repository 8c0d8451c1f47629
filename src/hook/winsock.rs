//! Winsock and process-creation detours.
//!
//! Each detour converts its raw arguments, asks the [`Interceptor`] what to
//! do and either delegates to the trampoline in [`HOOKS`] or reports the
//! redirect's outcome through the API's own convention (return value plus
//! `WSASetLastError`).

use std::collections::HashMap;
use std::ffi::{c_void, CStr, CString};
use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::ptr;
use std::slice;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use retour::RawDetour;
use socket2::{Domain, SockAddr};
use tracing::{debug, trace, warn};
use windows_sys::core::{GUID, PCSTR, PCWSTR, PSTR, PWSTR};
use windows_sys::Win32::Foundation::{BOOL, FALSE, TRUE};
use windows_sys::Win32::Networking::WinSock::{
    getpeername, getsockname, getsockopt, recv, send, shutdown, WSAGetLastError, WSASetLastError,
    AF_INET, AF_INET6, FIONBIO, LPWSAOVERLAPPED_COMPLETION_ROUTINE, QOS, SD_BOTH,
    SIO_GET_EXTENSION_FUNCTION_POINTER, SOCKADDR, SOCKADDR_IN, SOCKADDR_IN6, SOCKADDR_STORAGE,
    SOCKET, SOCKET_ADDRESS_LIST, SOCKET_ERROR, SOL_SOCKET, SO_PROTOCOL_INFOW, TIMEVAL, WSABUF,
    WSAEINVAL, WSAID_CONNECTEX, WSAPROTOCOL_INFOW, WSASend, WSA_IO_PENDING,
};
use windows_sys::Win32::Security::SECURITY_ATTRIBUTES;
use windows_sys::Win32::System::LibraryLoader::{GetProcAddress, LoadLibraryA};
use windows_sys::Win32::System::Threading::{
    PROCESS_CREATION_FLAGS, PROCESS_INFORMATION, STARTUPINFOA, STARTUPINFOW,
};
use windows_sys::Win32::System::IO::OVERLAPPED;

use crate::error::{HookError, Result};

use super::{Capability, HookState, HookTable, Interceptor, Patcher, SocketApi, SocketHandle};

type ConnectFn = unsafe extern "system" fn(s: SOCKET, name: *const SOCKADDR, namelen: i32) -> i32;

type WsaConnectFn = unsafe extern "system" fn(
    s: SOCKET,
    name: *const SOCKADDR,
    namelen: i32,
    caller_data: *const WSABUF,
    callee_data: *mut WSABUF,
    sqos: *const QOS,
    gqos: *const QOS,
) -> i32;

type WsaConnectByListFn = unsafe extern "system" fn(
    s: SOCKET,
    addresses: *const SOCKET_ADDRESS_LIST,
    local_len: *mut u32,
    local: *mut SOCKADDR,
    remote_len: *mut u32,
    remote: *mut SOCKADDR,
    timeout: *const TIMEVAL,
    reserved: *const OVERLAPPED,
) -> BOOL;

type WsaConnectByNameAFn = unsafe extern "system" fn(
    s: SOCKET,
    node: PCSTR,
    service: PCSTR,
    local_len: *mut u32,
    local: *mut SOCKADDR,
    remote_len: *mut u32,
    remote: *mut SOCKADDR,
    timeout: *const TIMEVAL,
    reserved: *const OVERLAPPED,
) -> BOOL;

type WsaConnectByNameWFn = unsafe extern "system" fn(
    s: SOCKET,
    node: PCWSTR,
    service: PCWSTR,
    local_len: *mut u32,
    local: *mut SOCKADDR,
    remote_len: *mut u32,
    remote: *mut SOCKADDR,
    timeout: *const TIMEVAL,
    reserved: *const OVERLAPPED,
) -> BOOL;

type ConnectExFn = unsafe extern "system" fn(
    s: SOCKET,
    name: *const SOCKADDR,
    namelen: i32,
    send_buf: *const c_void,
    send_len: u32,
    bytes_sent: *mut u32,
    overlapped: *mut OVERLAPPED,
) -> BOOL;

type IoctlSocketFn = unsafe extern "system" fn(s: SOCKET, cmd: i32, argp: *mut u32) -> i32;

type WsaIoctlFn = unsafe extern "system" fn(
    s: SOCKET,
    code: u32,
    in_buf: *const c_void,
    in_len: u32,
    out_buf: *mut c_void,
    out_len: u32,
    returned: *mut u32,
    overlapped: *mut OVERLAPPED,
    completion: LPWSAOVERLAPPED_COMPLETION_ROUTINE,
) -> i32;

type CreateProcessAFn = unsafe extern "system" fn(
    application: PCSTR,
    command_line: PSTR,
    process_attributes: *const SECURITY_ATTRIBUTES,
    thread_attributes: *const SECURITY_ATTRIBUTES,
    inherit_handles: BOOL,
    flags: PROCESS_CREATION_FLAGS,
    environment: *const c_void,
    current_directory: PCSTR,
    startup_info: *const STARTUPINFOA,
    process_info: *mut PROCESS_INFORMATION,
) -> BOOL;

type CreateProcessWFn = unsafe extern "system" fn(
    application: PCWSTR,
    command_line: PWSTR,
    process_attributes: *const SECURITY_ATTRIBUTES,
    thread_attributes: *const SECURITY_ATTRIBUTES,
    inherit_handles: BOOL,
    flags: PROCESS_CREATION_FLAGS,
    environment: *const c_void,
    current_directory: PCWSTR,
    startup_info: *const STARTUPINFOW,
    process_info: *mut PROCESS_INFORMATION,
) -> BOOL;

pub(crate) static HOOKS: HookTable = HookTable::new();

static PATCHER: Mutex<Option<RetourPatcher>> = Mutex::new(None);

static INTERCEPTOR: RwLock<Option<Arc<Interceptor<WinsockApi>>>> = RwLock::new(None);

/// Install every detour for `state`. Returns how many are active.
pub fn install(state: Arc<HookState>) -> Result<usize> {
    *INTERCEPTOR.write() = Some(Arc::new(Interceptor::new(WinsockApi, state)));

    let mut patcher = PATCHER.lock();
    let patcher = patcher.get_or_insert_with(RetourPatcher::default);
    let installed = HOOKS.install_all(patcher, resolve);
    if installed == 0 {
        return Err(HookError::Hook("no detour could be installed".to_string()));
    }
    debug!(installed, "detours installed");
    Ok(installed)
}

/// Disable the detours and drop the interceptor. Calls already inside a
/// detour finish against their trampolines.
pub fn uninstall() {
    if let Some(patcher) = PATCHER.lock().as_mut() {
        HOOKS.disable_all(patcher);
    }
    INTERCEPTOR.write().take();
    debug!("detours removed");
}

fn interceptor() -> Option<Arc<Interceptor<WinsockApi>>> {
    INTERCEPTOR.read().clone()
}

/// `retour`-backed [`Patcher`].
#[derive(Default)]
struct RetourPatcher {
    detours: HashMap<Capability, RawDetour>,
}

// SAFETY: the detours are only touched with the `PATCHER` lock held.
unsafe impl Send for RetourPatcher {}

impl Patcher for RetourPatcher {
    fn attach(&mut self, capability: Capability, target: usize, replacement: usize) -> Result<usize> {
        let detour = unsafe { RawDetour::new(target as *const (), replacement as *const ()) }
            .map_err(|e| HookError::Hook(format!("{}: {}", capability.symbol(), e)))?;
        let trampoline = detour.trampoline() as *const () as usize;
        self.detours.insert(capability, detour);
        Ok(trampoline)
    }

    fn enable(&mut self, capability: Capability) -> Result<()> {
        let detour = self.detour(capability)?;
        unsafe { detour.enable() }
            .map_err(|e| HookError::Hook(format!("{}: {}", capability.symbol(), e)))
    }

    fn disable(&mut self, capability: Capability) -> Result<()> {
        let detour = self.detour(capability)?;
        unsafe { detour.disable() }
            .map_err(|e| HookError::Hook(format!("{}: {}", capability.symbol(), e)))
    }
}

impl RetourPatcher {
    fn detour(&self, capability: Capability) -> Result<&RawDetour> {
        self.detours
            .get(&capability)
            .ok_or_else(|| HookError::Hook(format!("{} is not attached", capability.symbol())))
    }
}

fn resolve(capability: Capability) -> Option<(usize, usize)> {
    let module = capability.module()?;
    let target = proc_address(module, capability.symbol())?;
    Some((target, replacement(capability)))
}

fn replacement(capability: Capability) -> usize {
    match capability {
        Capability::Connect => connect_detour as usize,
        Capability::WsaConnect => wsa_connect_detour as usize,
        Capability::WsaConnectByList => wsa_connect_by_list_detour as usize,
        Capability::WsaConnectByNameA => wsa_connect_by_name_a_detour as usize,
        Capability::WsaConnectByNameW => wsa_connect_by_name_w_detour as usize,
        Capability::ConnectEx => connect_ex_detour as usize,
        Capability::IoctlSocket => ioctlsocket_detour as usize,
        Capability::WsaIoctl => wsa_ioctl_detour as usize,
        Capability::CreateProcessA => create_process_a_detour as usize,
        Capability::CreateProcessW => create_process_w_detour as usize,
    }
}

fn proc_address(module: &str, symbol: &str) -> Option<usize> {
    let module = CString::new(module).ok()?;
    let symbol = CString::new(symbol).ok()?;
    unsafe {
        let handle = LoadLibraryA(module.as_ptr().cast());
        if handle.is_null() {
            return None;
        }
        GetProcAddress(handle, symbol.as_ptr().cast()).map(|f| f as usize)
    }
}

/// Trampoline of an installed capability.
///
/// # Safety
/// `F` must be the function pointer type of `capability`.
unsafe fn original<F: Copy>(capability: Capability) -> Option<F> {
    HOOKS
        .original(capability)
        .map(|addr| mem::transmute_copy::<usize, F>(&addr))
}

fn last_error() -> io::Error {
    io::Error::from_raw_os_error(unsafe { WSAGetLastError() })
}

fn check(ret: i32) -> io::Result<()> {
    if ret == 0 {
        Ok(())
    } else {
        Err(last_error())
    }
}

fn fail(err: &HookError) -> i32 {
    unsafe { WSASetLastError(err.wsa_code()) };
    SOCKET_ERROR
}

fn missing_original() -> i32 {
    unsafe { WSASetLastError(WSAEINVAL) };
    SOCKET_ERROR
}

/// Read an IPv4/IPv6 `SOCKADDR`. Other families and short buffers yield
/// `None`.
unsafe fn sockaddr_from_raw(name: *const SOCKADDR, len: i32) -> Option<SockAddr> {
    if name.is_null() || len <= 0 {
        return None;
    }
    let len = len as usize;
    let addr = match (*name).sa_family {
        AF_INET if len >= mem::size_of::<SOCKADDR_IN>() => {
            let sin = &*(name as *const SOCKADDR_IN);
            SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(sin.sin_addr.S_un.S_addr)),
                u16::from_be(sin.sin_port),
            ))
        }
        AF_INET6 if len >= mem::size_of::<SOCKADDR_IN6>() => {
            let sin6 = &*(name as *const SOCKADDR_IN6);
            SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.u.Byte),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.Anonymous.sin6_scope_id,
            ))
        }
        _ => return None,
    };
    Some(SockAddr::from(addr))
}

/// Copy `addr` into a caller buffer, `WSAConnectByList` style: the length is
/// always updated, the bytes only when they fit.
unsafe fn write_sockaddr(addr: &SockAddr, out: *mut SOCKADDR, out_len: *mut u32) {
    if out.is_null() || out_len.is_null() {
        return;
    }
    let len = addr.len() as u32;
    if *out_len >= len {
        ptr::copy_nonoverlapping(addr.as_ptr() as *const u8, out as *mut u8, len as usize);
    }
    *out_len = len;
}

unsafe fn socket_name(
    s: SOCKET,
    query: unsafe extern "system" fn(SOCKET, *mut SOCKADDR, *mut i32) -> i32,
) -> io::Result<SockAddr> {
    let mut storage: SOCKADDR_STORAGE = mem::zeroed();
    let mut len = mem::size_of::<SOCKADDR_STORAGE>() as i32;
    check(query(s, &mut storage as *mut _ as *mut SOCKADDR, &mut len))?;
    sockaddr_from_raw(&storage as *const _ as *const SOCKADDR, len)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "not an IP socket"))
}

unsafe fn ansi_string(s: PCSTR) -> Option<String> {
    if s.is_null() {
        return None;
    }
    CStr::from_ptr(s.cast()).to_str().ok().map(str::to_owned)
}

unsafe fn wide_string(s: PCWSTR) -> Option<String> {
    if s.is_null() {
        return None;
    }
    let mut len = 0;
    while *s.add(len) != 0 {
        len += 1;
    }
    String::from_utf16(slice::from_raw_parts(s, len)).ok()
}

fn same_guid(a: &GUID, b: &GUID) -> bool {
    a.data1 == b.data1 && a.data2 == b.data2 && a.data3 == b.data3 && a.data4 == b.data4
}

/// [`SocketApi`] over the trampolines, so redirects never re-enter a detour.
pub(crate) struct WinsockApi;

impl SocketApi for WinsockApi {
    fn connect(&self, socket: SocketHandle, addr: &SockAddr) -> io::Result<()> {
        let connect = unsafe { original::<ConnectFn>(Capability::Connect) }
            .unwrap_or(windows_sys::Win32::Networking::WinSock::connect);
        check(unsafe { connect(socket, addr.as_ptr().cast(), addr.len()) })
    }

    fn send(&self, socket: SocketHandle, buf: &[u8]) -> io::Result<usize> {
        let len = buf.len().min(i32::MAX as usize) as i32;
        match unsafe { send(socket, buf.as_ptr(), len, 0) } {
            SOCKET_ERROR => Err(last_error()),
            n => Ok(n as usize),
        }
    }

    fn recv(&self, socket: SocketHandle, buf: &mut [u8]) -> io::Result<usize> {
        let len = buf.len().min(i32::MAX as usize) as i32;
        match unsafe { recv(socket, buf.as_mut_ptr(), len, 0) } {
            SOCKET_ERROR => Err(last_error()),
            n => Ok(n as usize),
        }
    }

    fn shutdown(&self, socket: SocketHandle) -> io::Result<()> {
        check(unsafe { shutdown(socket, SD_BOTH) })
    }

    fn set_nonblocking(&self, socket: SocketHandle, nonblocking: bool) -> io::Result<()> {
        let ioctl = unsafe { original::<IoctlSocketFn>(Capability::IoctlSocket) }
            .unwrap_or(windows_sys::Win32::Networking::WinSock::ioctlsocket);
        let mut arg = nonblocking as u32;
        check(unsafe { ioctl(socket, FIONBIO, &mut arg) })
    }

    fn local_addr(&self, socket: SocketHandle) -> io::Result<SockAddr> {
        unsafe { socket_name(socket, getsockname) }
    }

    fn peer_addr(&self, socket: SocketHandle) -> io::Result<SockAddr> {
        unsafe { socket_name(socket, getpeername) }
    }

    fn domain(&self, socket: SocketHandle) -> Option<Domain> {
        let mut info: WSAPROTOCOL_INFOW = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<WSAPROTOCOL_INFOW>() as i32;
        let ret = unsafe {
            getsockopt(
                socket,
                SOL_SOCKET,
                SO_PROTOCOL_INFOW,
                &mut info as *mut _ as *mut u8,
                &mut len,
            )
        };
        if ret != 0 {
            return None;
        }
        Some(Domain::from(info.iAddressFamily))
    }
}

unsafe fn redirect_connect<F>(
    s: SOCKET,
    name: *const SOCKADDR,
    namelen: i32,
    syscall: &str,
    dial: F,
) -> Option<i32>
where
    F: FnOnce(&SockAddr) -> io::Result<()>,
{
    let interceptor = interceptor()?;
    let addr = sockaddr_from_raw(name, namelen)?;
    match interceptor.connect(s, &addr, syscall, dial)? {
        Ok(()) => Some(0),
        Err(e) => Some(fail(&e)),
    }
}

unsafe extern "system" fn connect_detour(s: SOCKET, name: *const SOCKADDR, namelen: i32) -> i32 {
    trace!(socket = s, namelen, "connect");
    let Some(original) = original::<ConnectFn>(Capability::Connect) else {
        return missing_original();
    };
    redirect_connect(s, name, namelen, "connect", |addr| {
        check(original(s, addr.as_ptr().cast(), addr.len()))
    })
    .unwrap_or_else(|| original(s, name, namelen))
}

unsafe extern "system" fn wsa_connect_detour(
    s: SOCKET,
    name: *const SOCKADDR,
    namelen: i32,
    caller_data: *const WSABUF,
    callee_data: *mut WSABUF,
    sqos: *const QOS,
    gqos: *const QOS,
) -> i32 {
    trace!(socket = s, namelen, "WSAConnect");
    let Some(original) = original::<WsaConnectFn>(Capability::WsaConnect) else {
        return missing_original();
    };
    redirect_connect(s, name, namelen, "WSAConnect", |addr| {
        check(original(
            s,
            addr.as_ptr().cast(),
            addr.len(),
            caller_data,
            callee_data,
            sqos,
            gqos,
        ))
    })
    .unwrap_or_else(|| original(s, name, namelen, caller_data, callee_data, sqos, gqos))
}

unsafe extern "system" fn wsa_connect_by_list_detour(
    s: SOCKET,
    addresses: *const SOCKET_ADDRESS_LIST,
    local_len: *mut u32,
    local: *mut SOCKADDR,
    remote_len: *mut u32,
    remote: *mut SOCKADDR,
    timeout: *const TIMEVAL,
    reserved: *const OVERLAPPED,
) -> BOOL {
    trace!(socket = s, "WSAConnectByList");
    let Some(original) = original::<WsaConnectByListFn>(Capability::WsaConnectByList) else {
        missing_original();
        return FALSE;
    };
    let delegate = || original(s, addresses, local_len, local, remote_len, remote, timeout, reserved);

    let Some(interceptor) = interceptor() else {
        return delegate();
    };
    if addresses.is_null() || (*addresses).iAddressCount <= 0 {
        return delegate();
    }

    let entries = slice::from_raw_parts(
        (*addresses).Address.as_ptr(),
        (*addresses).iAddressCount as usize,
    );
    let candidates: Vec<SockAddr> = entries
        .iter()
        .filter_map(|entry| sockaddr_from_raw(entry.lpSockaddr, entry.iSockaddrLength))
        .collect();

    match interceptor.connect_by_list(s, &candidates) {
        None => delegate(),
        Some(Ok((local_addr, remote_addr))) => {
            write_sockaddr(&local_addr, local, local_len);
            write_sockaddr(&remote_addr, remote, remote_len);
            TRUE
        }
        Some(Err(e)) => {
            fail(&e);
            FALSE
        }
    }
}

unsafe fn redirect_by_name(
    s: SOCKET,
    node: Option<String>,
    service: Option<String>,
    syscall: &str,
    local_len: *mut u32,
    local: *mut SOCKADDR,
    remote_len: *mut u32,
    remote: *mut SOCKADDR,
) -> Option<BOOL> {
    let interceptor = interceptor()?;
    let (node, service) = (node?, service?);
    match interceptor.connect_by_name(s, &node, &service, syscall)? {
        Ok((local_addr, remote_addr)) => {
            write_sockaddr(&local_addr, local, local_len);
            write_sockaddr(&remote_addr, remote, remote_len);
            Some(TRUE)
        }
        Err(e) => {
            fail(&e);
            Some(FALSE)
        }
    }
}

unsafe extern "system" fn wsa_connect_by_name_a_detour(
    s: SOCKET,
    node: PCSTR,
    service: PCSTR,
    local_len: *mut u32,
    local: *mut SOCKADDR,
    remote_len: *mut u32,
    remote: *mut SOCKADDR,
    timeout: *const TIMEVAL,
    reserved: *const OVERLAPPED,
) -> BOOL {
    trace!(socket = s, "WSAConnectByNameA");
    let Some(original) = original::<WsaConnectByNameAFn>(Capability::WsaConnectByNameA) else {
        missing_original();
        return FALSE;
    };
    redirect_by_name(
        s,
        ansi_string(node),
        ansi_string(service),
        "WSAConnectByNameA",
        local_len,
        local,
        remote_len,
        remote,
    )
    .unwrap_or_else(|| {
        original(s, node, service, local_len, local, remote_len, remote, timeout, reserved)
    })
}

unsafe extern "system" fn wsa_connect_by_name_w_detour(
    s: SOCKET,
    node: PCWSTR,
    service: PCWSTR,
    local_len: *mut u32,
    local: *mut SOCKADDR,
    remote_len: *mut u32,
    remote: *mut SOCKADDR,
    timeout: *const TIMEVAL,
    reserved: *const OVERLAPPED,
) -> BOOL {
    trace!(socket = s, "WSAConnectByNameW");
    let Some(original) = original::<WsaConnectByNameWFn>(Capability::WsaConnectByNameW) else {
        missing_original();
        return FALSE;
    };
    redirect_by_name(
        s,
        wide_string(node),
        wide_string(service),
        "WSAConnectByNameW",
        local_len,
        local,
        remote_len,
        remote,
    )
    .unwrap_or_else(|| {
        original(s, node, service, local_len, local, remote_len, remote, timeout, reserved)
    })
}

/// Outcome of the initial overlapped send after a redirected `ConnectEx`.
enum InitialSend {
    Done(u32),
    Pending,
}

/// Start the caller's initial send as an overlapped `WSASend` on its own
/// `OVERLAPPED`, so completion is reported through the event or completion
/// port the caller waits on. An empty payload becomes a zero-byte send.
unsafe fn start_initial_send(
    s: SOCKET,
    send_buf: *const c_void,
    send_len: u32,
    overlapped: *mut OVERLAPPED,
) -> Result<InitialSend> {
    let buf = WSABUF {
        len: if send_buf.is_null() { 0 } else { send_len },
        buf: send_buf as *mut u8,
    };
    let mut sent = 0u32;
    if WSASend(s, &buf, 1, &mut sent, 0, overlapped, None) == 0 {
        return Ok(InitialSend::Done(sent));
    }
    match WSAGetLastError() {
        WSA_IO_PENDING => Ok(InitialSend::Pending),
        code => Err(HookError::IoError(io::Error::from_raw_os_error(code))),
    }
}

unsafe extern "system" fn connect_ex_detour(
    s: SOCKET,
    name: *const SOCKADDR,
    namelen: i32,
    send_buf: *const c_void,
    send_len: u32,
    bytes_sent: *mut u32,
    overlapped: *mut OVERLAPPED,
) -> BOOL {
    trace!(socket = s, namelen, send_len, "ConnectEx");
    let Some(original) = original::<ConnectExFn>(Capability::ConnectEx) else {
        missing_original();
        return FALSE;
    };
    let delegate = || original(s, name, namelen, send_buf, send_len, bytes_sent, overlapped);

    if overlapped.is_null() {
        return delegate();
    }
    let (Some(interceptor), Some(addr)) = (interceptor(), sockaddr_from_raw(name, namelen)) else {
        return delegate();
    };

    let outcome = interceptor.connect_ex(s, &addr, || {
        start_initial_send(s, send_buf, send_len, overlapped)
    });
    match outcome {
        None => delegate(),
        Some(Ok(InitialSend::Done(sent))) => {
            if !bytes_sent.is_null() {
                *bytes_sent = sent;
            }
            TRUE
        }
        Some(Ok(InitialSend::Pending)) => {
            WSASetLastError(WSA_IO_PENDING);
            FALSE
        }
        Some(Err(e)) => {
            fail(&e);
            FALSE
        }
    }
}

unsafe extern "system" fn ioctlsocket_detour(s: SOCKET, cmd: i32, argp: *mut u32) -> i32 {
    trace!(socket = s, cmd, "ioctlsocket");
    let Some(original) = original::<IoctlSocketFn>(Capability::IoctlSocket) else {
        return missing_original();
    };
    let ret = original(s, cmd, argp);
    if ret == 0 && cmd == FIONBIO && !argp.is_null() {
        if let Some(interceptor) = interceptor() {
            interceptor.record_blocking(s, *argp != 0);
        }
    }
    ret
}

unsafe extern "system" fn wsa_ioctl_detour(
    s: SOCKET,
    code: u32,
    in_buf: *const c_void,
    in_len: u32,
    out_buf: *mut c_void,
    out_len: u32,
    returned: *mut u32,
    overlapped: *mut OVERLAPPED,
    completion: LPWSAOVERLAPPED_COMPLETION_ROUTINE,
) -> i32 {
    trace!(socket = s, code, "WSAIoctl");
    let Some(original) = original::<WsaIoctlFn>(Capability::WsaIoctl) else {
        return missing_original();
    };
    let ret = original(s, code, in_buf, in_len, out_buf, out_len, returned, overlapped, completion);
    if ret != 0 {
        return ret;
    }

    if code == FIONBIO as u32 && !in_buf.is_null() && in_len as usize >= mem::size_of::<u32>() {
        if let Some(interceptor) = interceptor() {
            interceptor.record_blocking(s, *(in_buf as *const u32) != 0);
        }
    } else if code == SIO_GET_EXTENSION_FUNCTION_POINTER
        && !in_buf.is_null()
        && !out_buf.is_null()
        && in_len as usize >= mem::size_of::<GUID>()
        && out_len as usize >= mem::size_of::<usize>()
        && same_guid(&*(in_buf as *const GUID), &WSAID_CONNECTEX)
    {
        install_connect_ex(*(out_buf as *const usize));
    }
    ret
}

/// `ConnectEx` is only reachable through `WSAIoctl`, so it is detoured the
/// first time an application asks for it.
fn install_connect_ex(target: usize) {
    if HOOKS.is_installed(Capability::ConnectEx) || interceptor().is_none() {
        return;
    }
    let mut patcher = PATCHER.lock();
    let Some(patcher) = patcher.as_mut() else {
        return;
    };
    match HOOKS.install(
        patcher,
        Capability::ConnectEx,
        target,
        replacement(Capability::ConnectEx),
    ) {
        Ok(()) => debug!("ConnectEx detour installed"),
        Err(e) => warn!(error = %e, "failed to detour ConnectEx"),
    }
}

unsafe fn report_process(ret: BOOL, process_info: *const PROCESS_INFORMATION) {
    if ret == FALSE || process_info.is_null() {
        return;
    }
    if let Some(interceptor) = interceptor() {
        interceptor.process_created((*process_info).dwProcessId);
    }
}

unsafe extern "system" fn create_process_a_detour(
    application: PCSTR,
    command_line: PSTR,
    process_attributes: *const SECURITY_ATTRIBUTES,
    thread_attributes: *const SECURITY_ATTRIBUTES,
    inherit_handles: BOOL,
    flags: PROCESS_CREATION_FLAGS,
    environment: *const c_void,
    current_directory: PCSTR,
    startup_info: *const STARTUPINFOA,
    process_info: *mut PROCESS_INFORMATION,
) -> BOOL {
    trace!("CreateProcessA");
    let Some(original) = original::<CreateProcessAFn>(Capability::CreateProcessA) else {
        return FALSE;
    };
    let ret = original(
        application,
        command_line,
        process_attributes,
        thread_attributes,
        inherit_handles,
        flags,
        environment,
        current_directory,
        startup_info,
        process_info,
    );
    report_process(ret, process_info);
    ret
}

unsafe extern "system" fn create_process_w_detour(
    application: PCWSTR,
    command_line: PWSTR,
    process_attributes: *const SECURITY_ATTRIBUTES,
    thread_attributes: *const SECURITY_ATTRIBUTES,
    inherit_handles: BOOL,
    flags: PROCESS_CREATION_FLAGS,
    environment: *const c_void,
    current_directory: PCWSTR,
    startup_info: *const STARTUPINFOW,
    process_info: *mut PROCESS_INFORMATION,
) -> BOOL {
    trace!("CreateProcessW");
    let Some(original) = original::<CreateProcessWFn>(Capability::CreateProcessW) else {
        return FALSE;
    };
    let ret = original(
        application,
        command_line,
        process_attributes,
        thread_attributes,
        inherit_handles,
        flags,
        environment,
        current_directory,
        startup_info,
        process_info,
    );
    report_process(ret, process_info);
    ret
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sockaddr_from_raw_v4() {
        let addr = SockAddr::from("93.184.216.34:80".parse::<SocketAddr>().unwrap());
        let back = unsafe { sockaddr_from_raw(addr.as_ptr().cast(), addr.len()) }.unwrap();
        assert_eq!(back.as_socket(), addr.as_socket());
    }

    #[test]
    fn test_sockaddr_from_raw_v6_keeps_flowinfo_and_scope() {
        let v6 = SocketAddrV6::new("fe80::1".parse().unwrap(), 443, 0x0001_2345, 7);
        let addr = SockAddr::from(v6);
        let back = unsafe { sockaddr_from_raw(addr.as_ptr().cast(), addr.len()) }.unwrap();
        assert_eq!(back.as_socket(), Some(SocketAddr::V6(v6)));
    }

    #[test]
    fn test_sockaddr_from_raw_rejects_short_buffer() {
        let addr = SockAddr::from("93.184.216.34:80".parse::<SocketAddr>().unwrap());
        assert!(unsafe { sockaddr_from_raw(addr.as_ptr().cast(), 4) }.is_none());
        assert!(unsafe { sockaddr_from_raw(ptr::null(), 16) }.is_none());
    }

    #[test]
    fn test_write_sockaddr_reports_required_length() {
        let addr = SockAddr::from("[2001:db8::1]:443".parse::<SocketAddr>().unwrap());
        let mut storage: SOCKADDR_STORAGE = unsafe { mem::zeroed() };
        let mut len = 4u32;
        unsafe { write_sockaddr(&addr, &mut storage as *mut _ as *mut SOCKADDR, &mut len) };
        assert_eq!(len, addr.len() as u32);

        unsafe { write_sockaddr(&addr, &mut storage as *mut _ as *mut SOCKADDR, &mut len) };
        let back = unsafe { sockaddr_from_raw(&storage as *const _ as *const SOCKADDR, len as i32) };
        assert_eq!(back.unwrap().as_socket(), addr.as_socket());
    }
}
