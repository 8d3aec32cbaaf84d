use flint::logging;
use lodestar::serial::UartLink;
use lodestar::{Device, DeviceConfig};
use std::path::Path;
use std::time::Duration;

const CONFIG_PATH: &str = "device.toml";

fn main() {
    let log = logging::init();

    let config = if Path::new(CONFIG_PATH).exists() {
        DeviceConfig::load(CONFIG_PATH)
    } else {
        logging::warn!(log, "no device.toml found, using defaults");
        DeviceConfig::default()
    };

    if config.server.use_dtls {
        // The DTLS engine is supplied by the embedding application; this
        // runner only carries the plaintext transport.
        logging::crit!(log, "configure use_dtls = false or embed a DTLS engine");
        std::process::exit(1);
    }

    let link = UartLink::open(&config.modem.port, config.modem.baud_rate)
        .expect("Error opening modem serial port");

    let mut device = Device::new(link, config, log.clone());

    device.set_connection_status_handler(Box::new(move |status| {
        println!("connection status: {:?}", status);
    }));
    device.set_command_handler(Box::new(move |data, is_binary| {
        if is_binary {
            println!("command (binary, {} bytes): {:?}", data.len(), data);
        } else {
            println!("command: {}", String::from_utf8_lossy(data));
        }
    }));

    device.power_module_on().expect("Error powering up the device");
    logging::info!(log, "device is up, entering main loop");

    loop {
        device.spin();
        std::thread::sleep(Duration::from_millis(50));
    }
}
