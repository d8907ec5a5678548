//! Immediate Alert Service (0x1802)
//!
//! One write-only `Alert Level` characteristic. Inbound levels are forwarded
//! to an `AlertSink`; the default sink only logs (driving LEDs or a buzzer
//! belongs to whatever implements the sink).

use crate::infrastructure::gatt::characteristic::{CharacteristicHandler, GattError};
use crate::infrastructure::gatt::tree::ServiceTree;
use std::fmt;
use std::sync::Arc;
use tracing::info;

pub const SERVICE_UUID: &str = "1802";
pub const ALERT_LEVEL_CHARACTERISTIC_UUID: &str = "2a06";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLevel {
    None,
    Mild,
    High,
}

impl TryFrom<u8> for AlertLevel {
    type Error = GattError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(AlertLevel::None),
            1 => Ok(AlertLevel::Mild),
            2 => Ok(AlertLevel::High),
            other => Err(GattError::InvalidValue(format!(
                "unknown alert level {other}"
            ))),
        }
    }
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertLevel::None => write!(f, "none"),
            AlertLevel::Mild => write!(f, "mild"),
            AlertLevel::High => write!(f, "high"),
        }
    }
}

pub trait AlertSink: Send + Sync {
    fn alert(&self, level: AlertLevel);
}

pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn alert(&self, level: AlertLevel) {
        info!(%level, "alert level set");
    }
}

struct AlertLevelHandler {
    sink: Arc<dyn AlertSink>,
}

impl CharacteristicHandler for AlertLevelHandler {
    fn write(&self, value: &[u8]) -> Result<(), GattError> {
        let [byte] = value else {
            return Err(GattError::InvalidValue(format!(
                "alert level must be one byte, got {}",
                value.len()
            )));
        };
        let level = AlertLevel::try_from(*byte)?;
        self.sink.alert(level);
        Ok(())
    }
}

pub fn register(tree: &mut ServiceTree, sink: Arc<dyn AlertSink>) -> anyhow::Result<()> {
    let service = tree.add_service(SERVICE_UUID, true)?;
    tree.add_characteristic(
        &service,
        ALERT_LEVEL_CHARACTERISTIC_UUID,
        &["write", "write-without-response"],
        Arc::new(AlertLevelHandler { sink }),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingSink(Mutex<Vec<AlertLevel>>);

    impl AlertSink for RecordingSink {
        fn alert(&self, level: AlertLevel) {
            self.0.lock().unwrap().push(level);
        }
    }

    fn handler() -> (Arc<RecordingSink>, AlertLevelHandler) {
        let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        let handler = AlertLevelHandler { sink: sink.clone() };
        (sink, handler)
    }

    #[test]
    fn known_levels_reach_the_sink() {
        let (sink, handler) = handler();
        handler.write(&[0]).unwrap();
        handler.write(&[2]).unwrap();
        assert_eq!(
            *sink.0.lock().unwrap(),
            vec![AlertLevel::None, AlertLevel::High]
        );
    }

    #[test]
    fn unknown_level_is_rejected() {
        let (sink, handler) = handler();
        assert!(matches!(
            handler.write(&[3]),
            Err(GattError::InvalidValue(_))
        ));
        assert!(sink.0.lock().unwrap().is_empty());
    }

    #[test]
    fn wrong_length_is_rejected() {
        let (sink, handler) = handler();
        assert!(handler.write(&[]).is_err());
        assert!(handler.write(&[1, 2]).is_err());
        assert!(sink.0.lock().unwrap().is_empty());
    }
}
