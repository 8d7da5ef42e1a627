use once_cell::sync::Lazy;
use prometheus::{opts, Encoder, IntCounterVec, Registry, TextEncoder};

use crate::error::Result;

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);
pub static OPERATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        opts!("app_reconciler_operations_total", "Reconciliation engine operations by outcome"),
        &["operation", "outcome"],
    )
    .expect("static metric definition");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

/// Count one finished operation.
pub fn observe<T>(operation: &str, result: &Result<T>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(e) if e.is_not_found() => "not_found",
        Err(e) if e.is_not_supported() => "not_supported",
        Err(e) if e.is_not_valid() => "not_valid",
        Err(_) => "error",
    };
    OPERATIONS.with_label_values(&[operation, outcome]).inc();
}

/// Text exposition of every registered metric.
pub fn render() -> String {
    let mut buf = Vec::new();
    if TextEncoder::new().encode(&REGISTRY.gather(), &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn outcomes_are_labelled() {
        observe::<()>("telemetry-test", &Ok(()));
        observe::<()>("telemetry-test", &Err(Error::not_supported("topology \"cron\"")));
        assert_eq!(OPERATIONS.with_label_values(&["telemetry-test", "ok"]).get(), 1);
        assert_eq!(OPERATIONS.with_label_values(&["telemetry-test", "not_supported"]).get(), 1);
        assert!(render().contains("app_reconciler_operations_total"));
    }
}
