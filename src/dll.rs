//! `DllMain` of the injected library.

use std::ffi::c_void;

use tracing::warn;
use windows_sys::Win32::Foundation::{BOOL, HINSTANCE, TRUE};
use windows_sys::Win32::System::SystemServices::{DLL_PROCESS_ATTACH, DLL_PROCESS_DETACH};

use crate::hook::winsock;
use crate::runtime::{Runtime, RuntimeOptions};

fn attach() {
    let options = match RuntimeOptions::from_env() {
        Ok(options) => options,
        Err(e) => {
            warn!(error = %e, "bad controller setting, using the default");
            RuntimeOptions::new()
        }
    };

    let runtime = match Runtime::attach(options) {
        Ok(runtime) => runtime,
        Err(e) => {
            warn!(error = %e, "failed to start runtime, detours not installed");
            return;
        }
    };
    if let Err(e) = winsock::install(runtime.state().clone()) {
        warn!(error = %e, "failed to install detours");
    }
}

fn detach() {
    winsock::uninstall();
    // The control thread cannot be joined under the loader lock.
    Runtime::detach();
}

#[no_mangle]
#[allow(non_snake_case)]
pub extern "system" fn DllMain(_module: HINSTANCE, reason: u32, _reserved: *mut c_void) -> BOOL {
    match reason {
        DLL_PROCESS_ATTACH => attach(),
        DLL_PROCESS_DETACH => detach(),
        _ => {}
    }
    TRUE
}
