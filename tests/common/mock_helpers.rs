//! Engine and transport construction helpers

use motorscope::backend::{ScopeTransport, SessionEvent, SyntheticConfig, SyntheticTransport};
use motorscope::config::AppConfig;
use motorscope::registry::{default_definitions, SymbolMap, VariableRegistry};
use motorscope::CaptureEngine;
use crossbeam_channel::Receiver;

/// Simulator config at a fast link
pub fn create_test_config(baud_rate: u32) -> AppConfig {
    let mut config = AppConfig::sample();
    config.link.baud_rate = baud_rate;
    config.timeouts = super::fast_timeouts();
    config.probe.duration_ms = 200;
    config
}

/// Engine over a simulated target with the default variable set
pub fn create_test_engine(synthetic: SyntheticConfig, baud_rate: u32) -> CaptureEngine {
    let config = create_test_config(baud_rate);
    let mut transport = SyntheticTransport::new(synthetic, baud_rate);
    let symbols = SymbolMap::from_entries(
        transport
            .enumerate_variables()
            .expect("synthetic transport lists its variables"),
    );
    let registry = VariableRegistry::from_definitions(&default_definitions(), &symbols)
        .expect("default variables resolve against the simulator");
    CaptureEngine::new(Box::new(transport), registry, &config)
}

/// Everything currently queued on an event receiver
pub fn drain_events(rx: &Receiver<SessionEvent>) -> Vec<SessionEvent> {
    rx.try_iter().collect()
}
