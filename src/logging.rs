//! Ambient logging and panic reporting (spec.md §6).
//!
//! Every primitive already logs through the `log` facade (`log::trace!` on
//! lock contention, `log::error!` when a guard fails to release cleanly);
//! [`init`] wires that facade to `env_logger` so an application embedding
//! this crate gets readable output for free. Idempotent — more than one
//! caller (a binary, a test harness) may reasonably call it.

use std::sync::Once;

static INIT: Once = Once::new();

/// Install an `env_logger` subscriber (`RUST_LOG`-controlled, `info` by
/// default) and a panic hook that reports through `log::error!` instead of
/// the default stderr dump, so a panic on a worker thread still surfaces
/// through whatever sink the embedding application wired logging to.
pub fn init() {
    INIT.call_once(|| {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

        std::panic::set_hook(Box::new(|info| {
            let payload = info.payload();
            let message = if let Some(s) = payload.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "unspecified panic".to_string()
            };
            let location = info
                .location()
                .map(|loc| format!(" at {}:{}:{}", loc.file(), loc.line(), loc.column()))
                .unwrap_or_default();
            log::error!("panic: {message}{location}");
        }));
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init();
        init();
    }
}
