use once_cell_regex::regex_multi_line;

use crate::{Env, Runner, android::device::ConnectionStatus};

use super::{RunCheckedError, adb};

const ADB_DEVICE_REGEX: &str = r"^([\S]{6,100})\t([\S]{6,100})\b";

/// Serials and connection states from `adb devices`, in listing order.
pub fn device_list(
    runner: &dyn Runner,
    env: &Env,
) -> Result<Vec<(String, ConnectionStatus)>, RunCheckedError> {
    let raw_list = super::run_checked(runner, &adb(env, ["devices"]))?;
    Ok(parse_device_list(&raw_list))
}

fn parse_device_list(raw_list: &str) -> Vec<(String, ConnectionStatus)> {
    regex_multi_line!(ADB_DEVICE_REGEX)
        .captures_iter(raw_list)
        .map(|caps| {
            let serial_no = caps[1].to_owned();
            let status = match &caps[2] {
                "device" => ConnectionStatus::Connected,
                "unauthorized" => ConnectionStatus::Unauthorized,
                "offline" => ConnectionStatus::Offline,
                "authorizing" => ConnectionStatus::Authorizing,
                status => {
                    log::warn!("Unknown device status {status}");
                    ConnectionStatus::Offline
                }
            };
            (serial_no, status)
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    #[rstest(input, devices,
        case("* daemon not running; starting now at tcp:5020\n\
            * daemon started successfully\n\
            List of devices attached\n\
            AB1234DEFG\tdevice\n\
            192.168.100.103:55555\tdevice\n\
            ", vec!["AB1234DEFG", "192.168.100.103:55555"]
        ),
        case("List of devices attached \n", vec![]),
        case("** daemon not running; starting now at tcp:5037\n\
            * daemon started successfully\n\
            List of devices attached\n\
            emulator-5556\tdevice product:sdk_google_phone_x86_64 model:Android_SDK_built_for_x86_64 device:generic_x86_64\n\
            emulator-5554\tdevice product:sdk_google_phone_x86 model:Android_SDK_built_for_x86 device:generic_x86\n\
            0a388e93\tdevice usb:1-1 product:razor model:Nexus_7 device:flo\n\
            ", vec!["emulator-5556", "emulator-5554", "0a388e93"]
        ),
    )]
    fn test_adb_output_regex(input: &str, devices: Vec<&'static str>) {
        let serials = parse_device_list(input)
            .into_iter()
            .map(|(serial, _)| serial)
            .collect::<Vec<_>>();
        assert_eq!(serials, devices);
    }

    #[rstest(status, expected,
        case("device", ConnectionStatus::Connected),
        case("offline", ConnectionStatus::Offline),
        case("unauthorized", ConnectionStatus::Unauthorized),
        case("authorizing", ConnectionStatus::Authorizing),
        case("recovery", ConnectionStatus::Offline),
    )]
    fn test_device_status(status: &str, expected: ConnectionStatus) {
        let listing = format!("List of devices attached\nemulator-5554\t{status}\n");
        assert_eq!(
            parse_device_list(&listing),
            vec![("emulator-5554".to_string(), expected)]
        );
    }
}
