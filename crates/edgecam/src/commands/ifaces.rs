//! `edgecam ifaces`: interfaces a device could reach us on.

use crate::error::CliError;

pub fn handle() -> Result<(), CliError> {
    for name in edgecam_core::get_network_ifaces() {
        println!("{name}");
    }
    match edgecam_core::get_my_ip_by_routing() {
        Ok(ip) => println!("routing address: {ip}"),
        Err(e) => tracing::warn!(error = %e, "no routing address"),
    }
    Ok(())
}
