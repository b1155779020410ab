//! Operator control channel over a unix socket.
//!
//! The roles are inverted from a normal server: once a pod says hello, its
//! session *dials* the socket at `SOCKET_PATH` and then serves line-oriented
//! commands arriving on it. Each request is a decimal command code on its
//! own line, optionally followed by one argument line. Setters answer
//! `ok\n\n`; `DeviceStatus` answers a key=value block terminated by a blank
//! line; unknown codes and failed commands get no reply at all.
//!
//! The connection is retried every 5 seconds for as long as the session
//! lives.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::{debug, info, warn};

use crate::spark::commands::{self, BedSide, PodStatus};
use crate::spark::session::Session;

/// Command codes spoken on the control socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlCommand {
    AlarmLeft = 5,
    AlarmRight = 6,
    SetSettings = 8,
    LeftTempDur = 9,
    RightTempDur = 10,
    TempLevelLeft = 11,
    TempLevelRight = 12,
    Prime = 13,
    DeviceStatus = 14,
    AlarmClear = 16,
}

impl ControlCommand {
    fn from_code(code: u32) -> Option<Self> {
        match code {
            5 => Some(Self::AlarmLeft),
            6 => Some(Self::AlarmRight),
            8 => Some(Self::SetSettings),
            9 => Some(Self::LeftTempDur),
            10 => Some(Self::RightTempDur),
            11 => Some(Self::TempLevelLeft),
            12 => Some(Self::TempLevelRight),
            13 => Some(Self::Prime),
            14 => Some(Self::DeviceStatus),
            16 => Some(Self::AlarmClear),
            _ => None,
        }
    }
}

/// Dial the control socket and serve it until the session task aborts us.
pub async fn run(session: Arc<Session>, socket_path: String) {
    loop {
        match UnixStream::connect(&socket_path).await {
            Ok(stream) => {
                info!(socket_path = %socket_path, "connected to control socket");
                if let Err(e) = process(&session, stream).await {
                    debug!(error = %e, "control socket connection ended");
                }
            }
            Err(e) => {
                warn!(socket_path = %socket_path, error = %e, "cannot connect to control socket");
            }
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}

async fn process(session: &Session, mut stream: UnixStream) -> std::io::Result<()> {
    let mut buf = [0u8; 4096];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        let text = String::from_utf8_lossy(&buf[..n]).into_owned();
        let Some((code, arg)) = parse_request(&text) else {
            warn!(request = %text.trim_end(), "malformed control request");
            continue;
        };
        let Some(command) = ControlCommand::from_code(code) else {
            warn!(code, "unhandled control command");
            continue;
        };
        dispatch(session, command, arg, &mut stream).await?;
    }
}

/// Split `"<code>\n[<arg>\n]"` into the code and its argument line.
fn parse_request(text: &str) -> Option<(u32, &str)> {
    let mut lines = text.split('\n');
    let code = lines.next()?.trim().parse().ok()?;
    Some((code, lines.next().unwrap_or("")))
}

async fn dispatch(
    session: &Session,
    command: ControlCommand,
    arg: &str,
    stream: &mut UnixStream,
) -> std::io::Result<()> {
    debug!(device_id = %session.device_id(), ?command, "control command");
    let result = match command {
        ControlCommand::DeviceStatus => match commands::get_status(session).await {
            Ok(status) => {
                stream
                    .write_all(format_status_block(&status).as_bytes())
                    .await?;
                return Ok(());
            }
            Err(e) => Err(e),
        },
        ControlCommand::LeftTempDur => match arg.parse() {
            Ok(seconds) => commands::set_time(session, seconds, BedSide::Left).await,
            Err(_) => {
                warn!(arg, "bad duration argument");
                return Ok(());
            }
        },
        ControlCommand::RightTempDur => match arg.parse() {
            Ok(seconds) => commands::set_time(session, seconds, BedSide::Right).await,
            Err(_) => {
                warn!(arg, "bad duration argument");
                return Ok(());
            }
        },
        ControlCommand::TempLevelLeft => match arg.parse() {
            Ok(level) => commands::set_level(session, level, BedSide::Left).await,
            Err(_) => {
                warn!(arg, "bad level argument");
                return Ok(());
            }
        },
        ControlCommand::TempLevelRight => match arg.parse() {
            Ok(level) => commands::set_level(session, level, BedSide::Right).await,
            Err(_) => {
                warn!(arg, "bad level argument");
                return Ok(());
            }
        },
        ControlCommand::Prime => commands::prime(session).await,
        ControlCommand::AlarmLeft => commands::set_alarm(session, BedSide::Left, arg).await,
        ControlCommand::AlarmRight => commands::set_alarm(session, BedSide::Right, arg).await,
        ControlCommand::AlarmClear => commands::clear_alarms(session).await,
        ControlCommand::SetSettings => commands::set_settings(session, arg).await,
    };

    match result {
        Ok(()) => stream.write_all(b"ok\n\n").await,
        Err(e) => {
            warn!(?command, error = %e, "control command failed");
            Ok(())
        }
    }
}

/// The `DeviceStatus` reply block. Line order is fixed — the consumer on the
/// other end of the socket parses it positionally.
fn format_status_block(status: &PodStatus) -> String {
    format!(
        "tgHeatLevelR = {}\ntgHeatLevelL = {}\nheatTimeR = {}\nheatTimeL = {}\nheatLevelR = {}\nheatLevelL = {}\nsensorLabel = {}\nwaterLevel = {}\npriming = {}\nsettings = {}\n\n",
        status.target_heat_level_right,
        status.target_heat_level_left,
        status.heat_time_right,
        status.heat_time_left,
        status.heat_level_right,
        status.heat_level_left,
        status.sensor_label,
        status.water_level,
        status.priming,
        status.settings,
    )
}
