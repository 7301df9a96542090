mod executor;
pub mod session;

pub use executor::{
    command_to_script, group_hooks, shell_quote, Batch, Hook, HookEngine, HookKind, HookMode,
    HookReport, HookResult,
};
