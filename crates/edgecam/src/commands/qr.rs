//! `edgecam qr`: provisioning code for the active device.

use edgecam_core::{get_mqtt_ip, get_qr_object, qr_string};

use crate::cli::{GlobalOpts, QrArgs};
use crate::commands::ActiveDevice;
use crate::error::CliError;

pub fn handle(args: QrArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let device = ActiveDevice::resolve(global)?;
    let session = device.session_config()?;

    // The device must be told an address it can dial back.
    let mqtt_host = get_mqtt_ip(&session)?;
    let params =
        edgecam_config::profile_to_qr_params(&device.profile, &device.config.defaults, mqtt_host);

    println!("{}", qr_string(&params));
    if args.ascii {
        let matrix = get_qr_object(&params, args.border)?;
        print!("{}", matrix.to_ascii());
    }
    Ok(())
}
