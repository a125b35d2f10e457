// src/report.rs - Host-facing acknowledgement, config and status records
//! Plain serializable records. The core builds them; whoever owns the
//! response stream decides how to render them. Serialized with serde_json
//! they take the compact `{"r":{...}}` / `{"sr":{...}}` form.

use crate::config::tokens::Token;
use crate::error::{MotionError, STATUS_OK};
use crate::hardware::SwitchId;
use crate::machine::MachineMode;
use crate::{AXES, Axis};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StatusReport {
    /// Line number of the last block acknowledged.
    pub line: u32,
    /// Work position in program units.
    pub position: [f64; AXES],
    /// Machine position in millimetres.
    pub machine: [f64; AXES],
    /// mm/min, from the executing segment.
    pub velocity: f64,
    /// Free planner slots.
    pub available: usize,
    pub mode: MachineMode,
}

impl StatusReport {
    pub fn axis(&self, axis: Axis) -> f64 {
        self.position[axis.index()]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Response {
    #[serde(rename = "r")]
    Ack { line: Option<u32>, status: u8 },
    #[serde(rename = "cfg")]
    Config { token: Token, value: f64 },
    #[serde(rename = "sr")]
    Report(StatusReport),
    #[serde(rename = "er")]
    Alarm { switch: Option<SwitchId>, status: u8 },
}

impl Response {
    pub fn ack(line: Option<u32>, result: Result<(), MotionError>) -> Self {
        let status = match result {
            Ok(()) => STATUS_OK,
            Err(e) => e.code(),
        };
        Response::Ack { line, status }
    }

    pub fn is_ack(&self) -> bool {
        matches!(self, Response::Ack { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::SwitchEnd;

    #[test]
    fn ack_renders_compact_json() {
        let ok = Response::ack(Some(12), Ok(()));
        assert_eq!(serde_json::to_string(&ok).unwrap(), r#"{"r":{"line":12,"status":0}}"#);
        let err = Response::ack(None, Err(MotionError::SoftLimit));
        assert_eq!(serde_json::to_string(&err).unwrap(), r#"{"r":{"line":null,"status":12}}"#);
    }

    #[test]
    fn status_report_uses_sr_key() {
        let report = Response::Report(StatusReport {
            line: 3,
            position: [1.0, 2.0, 0.0, 0.0, 0.0, 0.0],
            machine: [1.0, 2.0, 0.0, 0.0, 0.0, 0.0],
            velocity: 600.0,
            available: 27,
            mode: MachineMode::Run,
        });
        let json: serde_json::Value = serde_json::to_value(&report).unwrap();
        assert_eq!(json["sr"]["mode"], "run");
        assert_eq!(json["sr"]["available"], 27);
        assert_eq!(json["sr"]["position"][1], 2.0);
    }

    #[test]
    fn config_and_alarm_records() {
        let cfg = Response::Config { token: Token::parse("xjm").unwrap(), value: 5000.0 };
        let json = serde_json::to_value(&cfg).unwrap();
        assert_eq!(json["cfg"]["token"], "xjm");
        let alarm = Response::Alarm {
            switch: Some(SwitchId { axis: Axis::Y, end: SwitchEnd::Max }),
            status: MotionError::HardwareAlarm.code(),
        };
        let json = serde_json::to_value(&alarm).unwrap();
        assert_eq!(json["er"]["switch"]["axis"], "y");
        assert_eq!(json["er"]["switch"]["end"], "max");
        assert_eq!(json["er"]["status"], 20);
    }
}
