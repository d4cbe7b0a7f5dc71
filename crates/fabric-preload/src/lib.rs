//! `LD_PRELOAD` shim that keeps "localhost" inside a workspace.
//!
//! Processes in a sandbox believe they bind and dial `127.0.0.1`; the shim moves those
//! sockets onto the workspace address from `fabric-identity` so that many workspaces can
//! share one host network namespace. Anything it does not understand passes through
//! untouched, and a process without a detectable workspace runs exactly as it would
//! without the shim.

use std::ffi::{c_char, c_int, c_void, CStr};
use std::fmt;
use std::io::Write;
use std::mem;
use std::net::Ipv4Addr;
use std::ptr;
use std::sync::OnceLock;

use fabric_identity::{
    detect_workspace, is_disabled, DEBUG_LOG_ENV, DISABLE_ENV, WORKSPACE_ENV,
};
use libc::{addrinfo, sockaddr, sockaddr_in, socklen_t, AF_INET};

type BindFn = unsafe extern "C" fn(c_int, *const sockaddr, socklen_t) -> c_int;
type ConnectFn = unsafe extern "C" fn(c_int, *const sockaddr, socklen_t) -> c_int;
type GetAddrInfoFn = unsafe extern "C" fn(
    *const c_char,
    *const c_char,
    *const addrinfo,
    *mut *mut addrinfo,
) -> c_int;

struct RealSymbols {
    bind: Option<BindFn>,
    connect: Option<ConnectFn>,
    getaddrinfo: Option<GetAddrInfoFn>,
}

impl RealSymbols {
    /// # Safety
    /// Must only be called from a process where `dlsym(RTLD_NEXT, ..)` is meaningful, i.e.
    /// from inside the preloaded library.
    unsafe fn resolve() -> Self {
        unsafe fn next(name: &CStr) -> *mut c_void {
            libc::dlsym(libc::RTLD_NEXT, name.as_ptr())
        }

        let bind = next(c"bind");
        let connect = next(c"connect");
        let getaddrinfo = next(c"getaddrinfo");
        Self {
            bind: (!bind.is_null()).then(|| mem::transmute::<*mut c_void, BindFn>(bind)),
            connect: (!connect.is_null())
                .then(|| mem::transmute::<*mut c_void, ConnectFn>(connect)),
            getaddrinfo: (!getaddrinfo.is_null())
                .then(|| mem::transmute::<*mut c_void, GetAddrInfoFn>(getaddrinfo)),
        }
    }
}

struct ShimState {
    workspace: Option<Ipv4Addr>,
    debug: bool,
    real: RealSymbols,
}

static STATE: OnceLock<ShimState> = OnceLock::new();

fn state() -> &'static ShimState {
    STATE.get_or_init(|| {
        let debug = std::env::var_os(DEBUG_LOG_ENV).is_some_and(|v| !v.is_empty());
        // SAFETY: we are the preloaded object; RTLD_NEXT resolves libc's definitions.
        let real = unsafe { RealSymbols::resolve() };
        let mut state = ShimState {
            workspace: None,
            debug,
            real,
        };
        state.workspace = state.detect();
        state
    })
}

impl ShimState {
    fn detect(&self) -> Option<Ipv4Addr> {
        let disable = std::env::var(DISABLE_ENV).ok();
        if is_disabled(disable.as_deref()) {
            self.log(format_args!("disabled via {DISABLE_ENV}"));
            return None;
        }

        let env_value = std::env::var(WORKSPACE_ENV).ok();
        let cwd = std::env::current_dir().ok();
        match detect_workspace(env_value.as_deref(), cwd.as_deref()) {
            Some((identity, source)) => {
                self.log(format_args!("workspace {identity} detected via {source:?}"));
                Some(identity.address)
            }
            None => None,
        }
    }

    fn log(&self, message: fmt::Arguments<'_>) {
        if self.debug {
            let _ = writeln!(std::io::stderr(), "[fabric-preload] {message}");
        }
    }
}

/// Target for a `bind`: the wildcard and `127.0.0.1` move to the workspace address.
fn rewrite_bind_target(ip: Ipv4Addr, workspace: Ipv4Addr) -> Ipv4Addr {
    if ip.is_unspecified() || ip == Ipv4Addr::LOCALHOST {
        workspace
    } else {
        ip
    }
}

/// Target for a `connect`: only `127.0.0.1` moves.
fn rewrite_connect_target(ip: Ipv4Addr, workspace: Ipv4Addr) -> Ipv4Addr {
    if ip == Ipv4Addr::LOCALHOST {
        workspace
    } else {
        ip
    }
}

fn is_local_node(node: &[u8]) -> bool {
    matches!(node, b"" | b"localhost" | b"127.0.0.1")
}

fn parse_service_port(service: &[u8]) -> Option<u16> {
    std::str::from_utf8(service)
        .ok()?
        .parse::<u16>()
        .ok()
        .filter(|port| *port > 0)
}

/// Copy an IPv4 socket address, applying `rewrite` to its host part.
///
/// Returns `None` when the address is not a full `sockaddr_in` or nothing changed, in
/// which case the caller forwards the original pointer.
///
/// # Safety
/// `addr` must be null or point to at least `len` readable bytes.
unsafe fn rewritten_sockaddr(
    addr: *const sockaddr,
    len: socklen_t,
    rewrite: impl Fn(Ipv4Addr) -> Ipv4Addr,
) -> Option<sockaddr_in> {
    if addr.is_null() || (len as usize) < mem::size_of::<sockaddr_in>() {
        return None;
    }
    let family = ptr::addr_of!((*addr).sa_family).read_unaligned();
    if c_int::from(family) != AF_INET {
        return None;
    }

    let mut sin = ptr::read_unaligned(addr.cast::<sockaddr_in>());
    let original = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
    let target = rewrite(original);
    if target == original {
        return None;
    }
    sin.sin_addr.s_addr = u32::from(target).to_be();
    Some(sin)
}

/// Allocate a single-entry IPv4 result in one block so that the platform
/// `freeaddrinfo` (which frees each node, not its `ai_addr`) releases all of it.
///
/// # Safety
/// The returned pointer must be released with `freeaddrinfo`.
unsafe fn alloc_local_result(
    address: Ipv4Addr,
    port: Option<u16>,
    socktype: c_int,
    protocol: c_int,
) -> Option<*mut addrinfo> {
    let ai_size = mem::size_of::<addrinfo>();
    let block = libc::calloc(1, ai_size + mem::size_of::<sockaddr_in>()).cast::<u8>();
    if block.is_null() {
        return None;
    }

    let ai = block.cast::<addrinfo>();
    let sin = block.add(ai_size).cast::<sockaddr_in>();

    (*sin).sin_family = AF_INET as libc::sa_family_t;
    (*sin).sin_port = port.unwrap_or(0).to_be();
    (*sin).sin_addr.s_addr = u32::from(address).to_be();

    (*ai).ai_family = AF_INET;
    (*ai).ai_socktype = socktype;
    (*ai).ai_protocol = protocol;
    (*ai).ai_addrlen = mem::size_of::<sockaddr_in>() as socklen_t;
    (*ai).ai_addr = sin.cast::<sockaddr>();
    (*ai).ai_next = ptr::null_mut();
    Some(ai)
}

#[cfg(all(target_os = "linux", not(test)))]
mod exports {
    use super::*;

    fn set_errno(code: c_int) {
        // SAFETY: __errno_location always returns the calling thread's errno slot.
        unsafe { *libc::__errno_location() = code };
    }

    const SOCKADDR_IN_LEN: socklen_t = mem::size_of::<sockaddr_in>() as socklen_t;

    /// # Safety
    /// Same contract as libc `bind`.
    #[no_mangle]
    pub unsafe extern "C" fn bind(fd: c_int, addr: *const sockaddr, len: socklen_t) -> c_int {
        let state = state();
        let Some(real) = state.real.bind else {
            set_errno(libc::EINVAL);
            return -1;
        };
        if let Some(workspace) = state.workspace {
            if let Some(sin) = rewritten_sockaddr(addr, len, |ip| rewrite_bind_target(ip, workspace))
            {
                state.log(format_args!("bind fd={fd} -> {workspace}"));
                return real(fd, ptr::addr_of!(sin).cast(), SOCKADDR_IN_LEN);
            }
        }
        real(fd, addr, len)
    }

    /// # Safety
    /// Same contract as libc `connect`.
    #[no_mangle]
    pub unsafe extern "C" fn connect(fd: c_int, addr: *const sockaddr, len: socklen_t) -> c_int {
        let state = state();
        let Some(real) = state.real.connect else {
            set_errno(libc::EINVAL);
            return -1;
        };
        if let Some(workspace) = state.workspace {
            if let Some(sin) =
                rewritten_sockaddr(addr, len, |ip| rewrite_connect_target(ip, workspace))
            {
                state.log(format_args!("connect fd={fd} -> {workspace}"));
                return real(fd, ptr::addr_of!(sin).cast(), SOCKADDR_IN_LEN);
            }
        }
        real(fd, addr, len)
    }

    /// # Safety
    /// Same contract as libc `getaddrinfo`.
    #[no_mangle]
    pub unsafe extern "C" fn getaddrinfo(
        node: *const c_char,
        service: *const c_char,
        hints: *const addrinfo,
        res: *mut *mut addrinfo,
    ) -> c_int {
        let state = state();
        let Some(real) = state.real.getaddrinfo else {
            return libc::EAI_SYSTEM;
        };
        let Some(workspace) = state.workspace else {
            return real(node, service, hints, res);
        };
        if node.is_null() || res.is_null() || !is_local_node(CStr::from_ptr(node).to_bytes()) {
            return real(node, service, hints, res);
        }

        let port = if service.is_null() {
            None
        } else {
            parse_service_port(CStr::from_ptr(service).to_bytes())
        };
        let (socktype, protocol) = if hints.is_null() {
            (0, 0)
        } else {
            ((*hints).ai_socktype, (*hints).ai_protocol)
        };

        match alloc_local_result(workspace, port, socktype, protocol) {
            Some(ai) => {
                state.log(format_args!("getaddrinfo localhost -> {workspace}"));
                *res = ai;
                0
            }
            None => libc::EAI_MEMORY,
        }
    }
}
