use std::thread;

use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use tracing::{error, info};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

fn counter(name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("static metric definition");
    REGISTRY.register(Box::new(counter.clone())).expect("metric registered once");
    counter
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let counter = IntCounterVec::new(Opts::new(name, help), labels).expect("static metric definition");
    REGISTRY.register(Box::new(counter.clone())).expect("metric registered once");
    counter
}

pub static PAYMENTS_CREATED: Lazy<IntCounter> =
    Lazy::new(|| counter("paywall_payments_created_total", "Payments minted"));
pub static PAYMENTS_CONFIRMED: Lazy<IntCounter> =
    Lazy::new(|| counter("paywall_payments_confirmed_total", "Payments confirmed on chain"));
pub static PAYMENTS_EXPIRED: Lazy<IntCounter> =
    Lazy::new(|| counter("paywall_payments_expired_total", "Payments swept to expired"));
pub static ADDRESSES_DERIVED: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec("paywall_addresses_derived_total", "Receiving addresses handed out", &["currency"])
});
pub static MONITOR_CYCLES: Lazy<IntCounter> =
    Lazy::new(|| counter("paywall_monitor_cycles_total", "Chain monitor poll cycles"));
pub static MONITOR_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec("paywall_monitor_errors_total", "Ledger client errors seen by the monitor", &["currency"])
});

/// Text exposition of every registered metric.
pub fn render() -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(buffer)
}

/// Serves `/metrics` (any path, really) on `bind` from a background thread.
pub fn serve(bind: &str) -> Result<()> {
    let server = tiny_http::Server::http(bind)
        .map_err(|e| anyhow!("could not start metrics server on {bind}: {e}"))?;
    info!(%bind, "metrics endpoint listening");

    thread::spawn(move || {
        let content_type =
            tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"text/plain; version=0.0.4"[..]).ok();
        for request in server.incoming_requests() {
            let body = match render() {
                Ok(body) => body,
                Err(e) => {
                    error!(error = %e, "could not encode metrics");
                    continue;
                }
            };
            let mut response = tiny_http::Response::from_data(body);
            if let Some(header) = content_type.clone() {
                response = response.with_header(header);
            }
            let _ = request.respond(response);
        }
    });

    Ok(())
}
