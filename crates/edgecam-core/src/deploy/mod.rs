// ── Module deployment ──
//
// `manifest` stages a module on the session webserver; `fsm` pushes it to
// the device and waits for the verdict.

mod fsm;
mod manifest;

pub use fsm::DeployFsm;
pub use manifest::{APPLICATION_NAME, single_module_manifest_setup};
