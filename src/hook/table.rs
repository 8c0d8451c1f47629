//! Capability-indexed table of original entry points.
//!
//! Each intercepted API is a [`Capability`]. Installing one asks a
//! [`Patcher`] to detour the target and stores the trampoline it hands back,
//! so a detour can always reach the un-hooked function.

use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{debug, warn};

use crate::error::{HookError, Result};

const CAPABILITY_COUNT: usize = 10;

/// An intercepted API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Connect,
    WsaConnect,
    WsaConnectByList,
    WsaConnectByNameA,
    WsaConnectByNameW,
    ConnectEx,
    IoctlSocket,
    WsaIoctl,
    CreateProcessA,
    CreateProcessW,
}

impl Capability {
    pub const ALL: [Capability; CAPABILITY_COUNT] = [
        Capability::Connect,
        Capability::WsaConnect,
        Capability::WsaConnectByList,
        Capability::WsaConnectByNameA,
        Capability::WsaConnectByNameW,
        Capability::ConnectEx,
        Capability::IoctlSocket,
        Capability::WsaIoctl,
        Capability::CreateProcessA,
        Capability::CreateProcessW,
    ];

    /// Exported symbol name.
    pub fn symbol(self) -> &'static str {
        match self {
            Capability::Connect => "connect",
            Capability::WsaConnect => "WSAConnect",
            Capability::WsaConnectByList => "WSAConnectByList",
            Capability::WsaConnectByNameA => "WSAConnectByNameA",
            Capability::WsaConnectByNameW => "WSAConnectByNameW",
            Capability::ConnectEx => "ConnectEx",
            Capability::IoctlSocket => "ioctlsocket",
            Capability::WsaIoctl => "WSAIoctl",
            Capability::CreateProcessA => "CreateProcessA",
            Capability::CreateProcessW => "CreateProcessW",
        }
    }

    /// Module exporting the symbol. `ConnectEx` is not exported; its address
    /// is only discovered through `WSAIoctl`.
    pub fn module(self) -> Option<&'static str> {
        match self {
            Capability::ConnectEx => None,
            Capability::CreateProcessA | Capability::CreateProcessW => Some("kernel32.dll"),
            _ => Some("ws2_32.dll"),
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Code patching backend.
pub trait Patcher {
    /// Route calls to `target` into `replacement`; returns the address that
    /// reaches the original code.
    fn attach(&mut self, capability: Capability, target: usize, replacement: usize) -> Result<usize>;

    fn enable(&mut self, capability: Capability) -> Result<()>;

    fn disable(&mut self, capability: Capability) -> Result<()>;
}

/// Original entry points, one slot per capability. Zero means not installed.
#[derive(Debug)]
pub struct HookTable {
    originals: [AtomicUsize; CAPABILITY_COUNT],
}

impl HookTable {
    pub const fn new() -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const EMPTY: AtomicUsize = AtomicUsize::new(0);
        Self {
            originals: [EMPTY; CAPABILITY_COUNT],
        }
    }

    /// Trampoline of an installed capability.
    pub fn original(&self, capability: Capability) -> Option<usize> {
        match self.originals[capability.index()].load(Ordering::Acquire) {
            0 => None,
            addr => Some(addr),
        }
    }

    pub fn is_installed(&self, capability: Capability) -> bool {
        self.original(capability).is_some()
    }

    /// Detour `target` to `replacement`. Installing twice is a no-op.
    ///
    /// The trampoline is published before the patch is enabled, so a detour
    /// never runs without its original.
    pub fn install<P: Patcher>(
        &self,
        patcher: &mut P,
        capability: Capability,
        target: usize,
        replacement: usize,
    ) -> Result<()> {
        if self.is_installed(capability) {
            return Ok(());
        }
        if target == 0 || replacement == 0 {
            return Err(HookError::Hook(format!(
                "null address for {}",
                capability.symbol()
            )));
        }

        let trampoline = patcher.attach(capability, target, replacement)?;
        self.originals[capability.index()].store(trampoline, Ordering::Release);
        if let Err(e) = patcher.enable(capability) {
            self.originals[capability.index()].store(0, Ordering::Release);
            return Err(e);
        }
        debug!(symbol = capability.symbol(), "hook installed");
        Ok(())
    }

    /// Install every capability `resolve` yields a `(target, replacement)`
    /// pair for. Failures are logged and skipped; returns how many hooks are
    /// active afterwards.
    pub fn install_all<P, F>(&self, patcher: &mut P, mut resolve: F) -> usize
    where
        P: Patcher,
        F: FnMut(Capability) -> Option<(usize, usize)>,
    {
        for capability in Capability::ALL {
            let Some((target, replacement)) = resolve(capability) else {
                continue;
            };
            if let Err(e) = self.install(patcher, capability, target, replacement) {
                warn!(symbol = capability.symbol(), error = %e, "failed to install hook");
            }
        }
        Capability::ALL
            .iter()
            .filter(|c| self.is_installed(**c))
            .count()
    }

    /// Disable every installed hook. Trampolines stay published for detours
    /// still running on other threads.
    pub fn disable_all<P: Patcher>(&self, patcher: &mut P) {
        for capability in Capability::ALL {
            if !self.is_installed(capability) {
                continue;
            }
            if let Err(e) = patcher.disable(capability) {
                warn!(symbol = capability.symbol(), error = %e, "failed to disable hook");
            }
        }
    }
}

impl Default for HookTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakePatcher {
        attached: HashMap<Capability, (usize, usize)>,
        enabled: Vec<Capability>,
        disabled: Vec<Capability>,
        refuse: Option<Capability>,
    }

    impl Patcher for FakePatcher {
        fn attach(&mut self, capability: Capability, target: usize, replacement: usize) -> Result<usize> {
            if self.refuse == Some(capability) {
                return Err(HookError::Hook("refused".to_string()));
            }
            self.attached.insert(capability, (target, replacement));
            Ok(target + 0x10)
        }

        fn enable(&mut self, capability: Capability) -> Result<()> {
            self.enabled.push(capability);
            Ok(())
        }

        fn disable(&mut self, capability: Capability) -> Result<()> {
            self.disabled.push(capability);
            Ok(())
        }
    }

    #[test]
    fn test_capability_indices_are_unique() {
        for (i, capability) in Capability::ALL.iter().enumerate() {
            assert_eq!(capability.index(), i);
        }
    }

    #[test]
    fn test_symbols_and_modules() {
        assert_eq!(Capability::Connect.symbol(), "connect");
        assert_eq!(Capability::IoctlSocket.symbol(), "ioctlsocket");
        assert_eq!(Capability::WsaConnect.module(), Some("ws2_32.dll"));
        assert_eq!(Capability::CreateProcessW.module(), Some("kernel32.dll"));
        assert_eq!(Capability::ConnectEx.module(), None);
    }

    #[test]
    fn test_install_publishes_trampoline() {
        let table = HookTable::new();
        let mut patcher = FakePatcher::default();
        assert_eq!(table.original(Capability::Connect), None);

        table
            .install(&mut patcher, Capability::Connect, 0x1000, 0x2000)
            .unwrap();
        assert_eq!(table.original(Capability::Connect), Some(0x1010));
        assert_eq!(patcher.enabled, vec![Capability::Connect]);

        // Second install keeps the first trampoline.
        table
            .install(&mut patcher, Capability::Connect, 0x3000, 0x4000)
            .unwrap();
        assert_eq!(table.original(Capability::Connect), Some(0x1010));
        assert_eq!(patcher.attached.len(), 1);
    }

    #[test]
    fn test_install_rejects_null_addresses() {
        let table = HookTable::new();
        let mut patcher = FakePatcher::default();
        assert!(table
            .install(&mut patcher, Capability::WsaIoctl, 0, 0x2000)
            .is_err());
        assert!(!table.is_installed(Capability::WsaIoctl));
    }

    #[test]
    fn test_install_all_skips_missing_and_failed() {
        let table = HookTable::new();
        let mut patcher = FakePatcher {
            refuse: Some(Capability::WsaConnect),
            ..Default::default()
        };

        let installed = table.install_all(&mut patcher, |capability| match capability {
            Capability::ConnectEx => None,
            other => Some((0x1000 * (other.index() + 1), 0x9000)),
        });
        assert_eq!(installed, Capability::ALL.len() - 2);
        assert!(!table.is_installed(Capability::ConnectEx));
        assert!(!table.is_installed(Capability::WsaConnect));
        assert!(table.is_installed(Capability::CreateProcessA));

        table.disable_all(&mut patcher);
        assert_eq!(patcher.disabled.len(), installed);
        assert!(table.is_installed(Capability::Connect));
    }
}
