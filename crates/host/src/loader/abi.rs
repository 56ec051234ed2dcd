//! FFI contract between the host and native plugin modules.
//!
//! A module exports a [`ModuleDeclaration`] under a well-known symbol. The
//! host reads it, checks the ABI revision, and calls the registration
//! function with a [`ModuleRegistrar`], through which the module announces
//! its capabilities and any host-level registration hooks.
//!
//! The capability contract is a string tag, not a shared type: a module
//! compiled against its own copy of this crate still matches, because
//! discovery compares contract names (see the load pipeline).

use crate::registry::HostServices;

/// Host ABI revision. Bumped on any breaking change to this file.
pub const ABI_VERSION: u32 = 1;

/// The well-known contract tag capabilities are discovered by.
pub const CAPABILITY_CONTRACT: &str = "berth.plugin.Capability";

/// Preferred declaration symbol, revisioned with the ABI.
pub const DECLARATION_SYMBOL_VERSIONED: &[u8] = b"berth_module_declaration_v1\0";

/// Fallback declaration symbol for modules built before revisioned symbols.
pub const DECLARATION_SYMBOL: &[u8] = b"berth_module_declaration\0";

/// A capability activated from a native module.
pub trait PluginCapability: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }
}

/// Constructor a module provides for each capability it declares.
pub type CapabilityCtor = fn() -> Box<dyn PluginCapability>;

/// Hook invoked against the host services during package loading.
pub type RegistrationHook = fn(&mut HostServices);

/// What a module's registration function talks to.
pub trait ModuleRegistrar {
    /// Declares one capability under a contract tag and a type name.
    fn register_capability(&mut self, contract: &str, type_name: &str, construct: CapabilityCtor);

    /// Declares a hook to run against the host's registry and scope.
    fn register_host_hook(&mut self, hook: RegistrationHook);
}

/// The struct a module exports under the declaration symbol.
#[repr(C)]
pub struct ModuleDeclaration {
    pub abi_version: u32,
    pub register: unsafe extern "C" fn(&mut dyn ModuleRegistrar),
}

/// Exports a [`ModuleDeclaration`] under the revisioned declaration symbol.
///
/// Module crates (built as `cdylib`) use this to wire their registration
/// function in:
///
/// ```ignore
/// fn register(registrar: &mut dyn ModuleRegistrar) {
///     registrar.register_capability(CAPABILITY_CONTRACT, "Summarizer", || Box::new(Summarizer));
/// }
/// berth_host::declare_module!(register);
/// ```
#[macro_export]
macro_rules! declare_module {
    ($register:path) => {
        const _: () = {
            unsafe extern "C" fn __berth_register(
                registrar: &mut dyn $crate::loader::abi::ModuleRegistrar,
            ) {
                $register(registrar)
            }

            #[unsafe(no_mangle)]
            pub static berth_module_declaration_v1: $crate::loader::abi::ModuleDeclaration =
                $crate::loader::abi::ModuleDeclaration {
                    abi_version: $crate::loader::abi::ABI_VERSION,
                    register: __berth_register,
                };
        };
    };
}

/// A capability discovered from a module, with owned strings so it outlives
/// any later teardown of the declaring context.
#[derive(Clone)]
pub struct CapabilityDecl {
    pub contract: String,
    pub type_name: String,
    pub construct: CapabilityCtor,
}

impl std::fmt::Debug for CapabilityDecl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityDecl")
            .field("contract", &self.contract)
            .field("type_name", &self.type_name)
            .finish()
    }
}

/// Collects a module's declarations during registration.
#[derive(Default)]
pub struct DeclarationCollector {
    pub capabilities: Vec<CapabilityDecl>,
    pub hooks: Vec<RegistrationHook>,
}

impl ModuleRegistrar for DeclarationCollector {
    fn register_capability(&mut self, contract: &str, type_name: &str, construct: CapabilityCtor) {
        self.capabilities.push(CapabilityDecl {
            contract: contract.to_string(),
            type_name: type_name.to_string(),
            construct,
        });
    }

    fn register_host_hook(&mut self, hook: RegistrationHook) {
        self.hooks.push(hook);
    }
}

/// Selects the capabilities matching the host contract.
///
/// Exact matches win. With zero exact matches, declarations whose trailing
/// dot-separated segment equals the contract's trailing segment are
/// accepted, so a module built against a re-namespaced copy of the contract
/// constant is still discovered.
pub fn select_capabilities(declared: &[CapabilityDecl]) -> Vec<CapabilityDecl> {
    let exact: Vec<CapabilityDecl> = declared
        .iter()
        .filter(|decl| decl.contract == CAPABILITY_CONTRACT)
        .cloned()
        .collect();
    if !exact.is_empty() {
        return exact;
    }

    let tail = trailing_segment(CAPABILITY_CONTRACT);
    declared
        .iter()
        .filter(|decl| trailing_segment(&decl.contract) == tail)
        .cloned()
        .collect()
}

fn trailing_segment(contract: &str) -> &str {
    contract.rsplit('.').next().unwrap_or(contract)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    impl PluginCapability for Noop {
        fn name(&self) -> &str {
            "noop"
        }
    }

    fn make_noop() -> Box<dyn PluginCapability> {
        Box::new(Noop)
    }

    fn decl(contract: &str, type_name: &str) -> CapabilityDecl {
        CapabilityDecl {
            contract: contract.to_string(),
            type_name: type_name.to_string(),
            construct: make_noop,
        }
    }

    #[test]
    fn collector_gathers_capabilities_and_hooks() {
        fn hook(_services: &mut HostServices) {}

        let mut collector = DeclarationCollector::default();
        collector.register_capability(CAPABILITY_CONTRACT, "Summarizer", make_noop);
        collector.register_host_hook(hook);

        assert_eq!(collector.capabilities.len(), 1);
        assert_eq!(collector.capabilities[0].type_name, "Summarizer");
        assert_eq!(collector.hooks.len(), 1);
    }

    #[test]
    fn exact_contract_matches_win() {
        let declared = vec![
            decl(CAPABILITY_CONTRACT, "A"),
            decl("vendor.fork.Capability", "B"),
            decl("unrelated.Widget", "C"),
        ];
        let selected = select_capabilities(&declared);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].type_name, "A");
    }

    #[test]
    fn trailing_segment_fallback_catches_renamespaced_contracts() {
        let declared = vec![
            decl("vendor.fork.Capability", "B"),
            decl("unrelated.Widget", "C"),
        ];
        let selected = select_capabilities(&declared);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].type_name, "B");
    }

    #[test]
    fn no_match_yields_empty_set() {
        let declared = vec![decl("unrelated.Widget", "C")];
        assert!(select_capabilities(&declared).is_empty());
    }
}
