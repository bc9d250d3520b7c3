//! Driver wire-conversation tests against the scripted transport.

use psu_bridge::config::InstrumentConfig;
use psu_bridge::instrument::{
    Identity, Instrument, InstrumentIo, IsegShr, Keithley2470, TtiPl303Qmdp,
};
use psu_bridge::transport::mock::{MockTrace, MockWireResource};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

fn descriptor(name: &str, type_tag: &str, config: Value) -> InstrumentConfig {
    InstrumentConfig {
        name: name.to_string(),
        type_tag: type_tag.to_string(),
        serial_number: Some("SN-TEST".to_string()),
        resource: None,
        read_termination: None,
        write_termination: None,
        config,
    }
}

fn identity() -> Identity {
    Identity {
        manufacturer: "Test".to_string(),
        model: "PSU".to_string(),
        serial: "SN-TEST".to_string(),
        firmware: "1.0".to_string(),
    }
}

fn written(trace: &Arc<Mutex<MockTrace>>) -> Vec<String> {
    trace.lock().unwrap().written.clone()
}

mod keithley {
    use super::*;

    fn smu(
        config: Value,
        handler: impl FnMut(&str) -> Option<String> + Send + 'static,
    ) -> (Arc<dyn Instrument>, Arc<Mutex<MockTrace>>) {
        let mock = MockWireResource::new("/dev/ttyUSB0", false, handler);
        let trace = mock.trace();
        let io = InstrumentIo::new(Box::new(mock), false);
        let cfg = descriptor("smu1", "Keithley2470", config);
        let instrument = Keithley2470::connect(&cfg, io, identity()).unwrap();
        (instrument, trace)
    }

    fn sourcing(function: &'static str) -> impl FnMut(&str) -> Option<String> + Send + 'static {
        move |cmd: &str| {
            if cmd == "SOUR:FUNC?" {
                Some(function.to_string())
            } else {
                None
            }
        }
    }

    #[tokio::test]
    async fn test_set_voltage_clamps_to_source_limit() {
        let (smu, trace) = smu(json!({"source_limit": 10}), sourcing("VOLT"));

        smu.set_voltage(15.0, None).await.unwrap();
        smu.set_voltage(-15.0, None).await.unwrap();
        smu.set_voltage(5.0, None).await.unwrap();

        let w = written(&trace);
        assert!(w.contains(&"SOUR:VOLT 10".to_string()));
        assert!(w.contains(&"SOUR:VOLT -10".to_string()));
        assert!(w.contains(&"SOUR:VOLT 5".to_string()));
    }

    #[tokio::test]
    async fn test_set_voltage_unclamped_without_limit() {
        let (smu, trace) = smu(json!({}), sourcing("VOLT"));
        smu.set_voltage(1500.0, None).await.unwrap();
        assert!(written(&trace).contains(&"SOUR:VOLT 1500".to_string()));
    }

    #[tokio::test]
    async fn test_set_voltage_blocked_while_sourcing_current() {
        let (smu, trace) = smu(json!({}), sourcing("CURR"));

        smu.set_voltage(5.0, None).await.unwrap();

        // Only the interlock query went out; no setpoint write.
        let w = written(&trace);
        assert!(w.iter().all(|c| !c.starts_with("SOUR:VOLT ")));
    }

    #[tokio::test]
    async fn test_set_current_blocked_while_sourcing_voltage() {
        let (smu, trace) = smu(json!({}), sourcing("VOLT"));
        smu.set_current(0.001, None).await.unwrap();
        assert!(written(&trace).iter().all(|c| !c.starts_with("SOUR:CURR ")));
    }

    #[tokio::test]
    async fn test_rejects_channel_argument() {
        let (smu, _) = smu(json!({}), sourcing("VOLT"));
        assert!(smu.set_voltage(5.0, Some("CH1")).await.is_err());
        assert!(smu.set_output(true, Some("CH1")).await.is_err());
    }

    #[tokio::test]
    async fn test_read_reports_measurements_and_output_state() {
        let (smu, _) = smu(
            json!({}),
            |cmd: &str| match cmd {
                "MEAS:VOLT?" => Some("1.25".to_string()),
                "MEAS:CURR?" => Some("0.003".to_string()),
                "OUTP?" => Some("1".to_string()),
                _ => None,
            },
        );

        let readings = smu.read().await.unwrap();
        assert_eq!(readings["voltage"], 1.25);
        assert_eq!(readings["current"], 0.003);
        assert_eq!(readings["power_state"], 1.0);
    }

    #[tokio::test]
    async fn test_get_set_values_reads_source_setpoints() {
        let (smu, _) = smu(
            json!({}),
            |cmd: &str| match cmd {
                "SOUR:VOLT?" => Some("200".to_string()),
                "SOUR:CURR?" => Some("0.0001".to_string()),
                _ => None,
            },
        );

        let values = smu.get_set_values().await.unwrap();
        assert_eq!(values["set_voltage"], 200.0);
        assert_eq!(values["set_current"], 0.0001);
    }

    #[tokio::test]
    async fn test_reset_sequence() {
        let (smu, trace) = smu(json!({}), |_| None);
        smu.reset().await.unwrap();
        assert_eq!(written(&trace), vec!["*CLS", "*RST"]);
    }

    #[tokio::test]
    async fn test_configure_starts_safe_and_applies_defaults() {
        let (smu, trace) = smu(json!({}), |_| None);
        smu.configure(None).await.unwrap();

        let w = written(&trace);
        assert_eq!(&w[..3], &["OUTP OFF", "*RST", "SYST:CLE"]);
        // Defaults: voltage source, 20 V source range, NPLC 2, protection off.
        assert!(w.contains(&"SOUR:FUNC VOLT".to_string()));
        assert!(w.contains(&"SOUR:VOLT:RANG 20".to_string()));
        assert!(w.contains(&"SENS:NPLC 2".to_string()));
        assert!(w.contains(&"SOUR:VOLT:PROT NONE".to_string()));
        assert!(w.contains(&"SENS:AVER OFF".to_string()));
    }

    #[tokio::test]
    async fn test_configure_out_of_domain_values_fall_back() {
        let config = json!({
            "nplc": 20,
            "terminals": "sideways",
            "overvoltage_protection": "PROT9000",
            "current_range": 10
        });
        let (smu, trace) = smu(config, |_| None);
        smu.configure(None).await.unwrap();

        let w = written(&trace);
        // NPLC out of [0.01, 10] falls back to 1, not the absent-default 2.
        assert!(w.contains(&"SENS:NPLC 1".to_string()));
        assert!(w.contains(&"ROUT:TERM FRON".to_string()));
        assert!(w.contains(&"SOUR:VOLT:PROT NONE".to_string()));
        // 10 uA measurement range, normalized to amps.
        assert!(w.contains(&"SENS:CURR:RANG 0.00001".to_string()));
    }

    #[tokio::test]
    async fn test_configure_auto_ranges() {
        let config = json!({"source_range": "auto", "current_range": "AUTO"});
        let (smu, trace) = smu(config, |_| None);
        smu.configure(None).await.unwrap();

        let w = written(&trace);
        assert!(w.contains(&"SOUR:VOLT:RANG:AUTO ON".to_string()));
        assert!(w.contains(&"SENS:CURR:RANG:AUTO ON".to_string()));
    }

    #[tokio::test]
    async fn test_configure_current_source_normalizes_microamps() {
        let config = json!({"source": "current", "source_range": 100});
        let (smu, trace) = smu(config, |_| None);
        smu.configure(None).await.unwrap();

        let w = written(&trace);
        assert!(w.contains(&"SOUR:FUNC CURR".to_string()));
        assert!(w.contains(&"SOUR:CURR:RANG 0.0001".to_string()));
    }
}

mod iseg {
    use super::*;

    fn hv(
        config: Value,
        handler: impl FnMut(&str) -> Option<String> + Send + 'static,
    ) -> (Arc<dyn Instrument>, Arc<Mutex<MockTrace>>) {
        let mock = MockWireResource::new("/dev/ttyUSB3", true, handler);
        let trace = mock.trace();
        let io = InstrumentIo::new(Box::new(mock), true);
        let cfg = descriptor("hv1", "ISEGSHR", config);
        let instrument = IsegShr::connect(&cfg, io, identity()).unwrap();
        (instrument, trace)
    }

    #[tokio::test]
    async fn test_commands_consume_echo_and_status_lines() {
        let (hv, trace) = hv(json!({}), |_| Some("ok".to_string()));

        hv.set_voltage(500.0, Some("CH2")).await.unwrap();

        let t = trace.lock().unwrap();
        assert_eq!(t.written, vec![":VOLT 500,(@2)"]);
        // One echo line plus one status line, both drained.
        assert_eq!(t.reads, 2);
        assert!(t.pending.is_empty());
    }

    #[tokio::test]
    async fn test_read_strips_unit_suffix_per_channel() {
        let (hv, _) = hv(json!({}), |cmd: &str| {
            if cmd.starts_with(":MEAS:VOLT?") {
                Some("12.5V".to_string())
            } else if cmd.starts_with(":MEAS:CURR?") {
                Some("0.0005A".to_string())
            } else if cmd.starts_with(":READ:VOLT:ON?") {
                Some("1".to_string())
            } else {
                Some("ok".to_string())
            }
        });

        let readings = hv.read().await.unwrap();
        assert_eq!(readings.len(), 12);
        assert_eq!(readings["CH0_voltage"], 12.5);
        assert_eq!(readings["CH3_current"], 0.0005);
        assert_eq!(readings["CH1_power_state"], 1.0);
    }

    #[tokio::test]
    async fn test_setpoints_require_valid_channel() {
        let (hv, _) = hv(json!({}), |_| Some("ok".to_string()));
        assert!(hv.set_voltage(10.0, None).await.is_err());
        assert!(hv.set_voltage(10.0, Some("CH9")).await.is_err());
        assert!(hv.set_current(0.001, None).await.is_err());
    }

    #[tokio::test]
    async fn test_set_output_addresses_one_or_all_channels() {
        let (hv, trace) = hv(json!({}), |_| Some("ok".to_string()));

        hv.set_output(true, None).await.unwrap();
        hv.set_output(false, Some("CH1")).await.unwrap();

        let w = written(&trace);
        assert_eq!(w, vec![":VOLT ON,(@0-3)", ":VOLT OFF,(@1)"]);
    }

    #[tokio::test]
    async fn test_configure_programs_channel_settings() {
        let config = json!({
            "averaging_steps": "256",
            "channels": {
                "CH1": {
                    "voltage": 500.0,
                    "current": 0.0005,
                    "trip_time": 0.25,
                    "trip_action": "ramp_down",
                    "output_polarity": "p"
                }
            }
        });
        let (hv, trace) = hv(config, |_| Some("ok".to_string()));
        hv.configure(None).await.unwrap();

        let w = written(&trace);
        assert_eq!(&w[..4], &[":VOLT OFF,(@0-3)", "*RST", "*CLS", ":EVENT CLEAR,(@0-3)"]);
        assert!(w.contains(&":CONF:AVER 256".to_string()));
        assert!(w.contains(&":CONF:TRIP:TIME 250,(@1)".to_string()));
        assert!(w.contains(&":CONF:TRIP:ACTION 1,(@1)".to_string()));
        assert!(w.contains(&":CONF:OUTPUT:POL p,(@1)".to_string()));
        assert!(w.contains(&":VOLT 500,(@1)".to_string()));
        assert!(w.contains(&":CURR 0.0005,(@1)".to_string()));
        // Unconfigured channels are left alone.
        assert!(w.iter().all(|c| !c.ends_with("(@0)")));
    }
}

mod tti {
    use super::*;

    fn psu(
        config: Value,
        handler: impl FnMut(&str) -> Option<String> + Send + 'static,
    ) -> (Arc<dyn Instrument>, Arc<Mutex<MockTrace>>) {
        let mock = MockWireResource::new("/dev/ttyACM0", false, handler);
        let trace = mock.trace();
        let io = InstrumentIo::new(Box::new(mock), false);
        let cfg = descriptor("psu1", "TTiPL303QMDP", config);
        let instrument = TtiPl303Qmdp::connect(&cfg, io, identity()).unwrap();
        (instrument, trace)
    }

    #[tokio::test]
    async fn test_setpoints_use_channel_digit() {
        let (psu, trace) = psu(json!({}), |_| None);

        psu.set_voltage(5.0, Some("CH2")).await.unwrap();
        psu.set_current(0.45, Some("CH1")).await.unwrap();

        assert_eq!(written(&trace), vec!["V2 5", "I1 0.45"]);
    }

    #[tokio::test]
    async fn test_setpoints_require_channel() {
        let (psu, _) = psu(json!({}), |_| None);
        assert!(psu.set_voltage(5.0, None).await.is_err());
        assert!(psu.set_current(0.5, Some("CH3")).await.is_err());
    }

    #[tokio::test]
    async fn test_read_parses_suffixed_outputs() {
        let (psu, _) = psu(json!({}), |cmd: &str| match cmd {
            "V1O?" => Some("4.95V".to_string()),
            "I1O?" => Some("0.48A".to_string()),
            "V2O?" => Some("11.9V".to_string()),
            "I2O?" => Some("0.97A".to_string()),
            _ => None,
        });

        let readings = psu.read().await.unwrap();
        assert_eq!(readings["CH1_voltage"], 4.95);
        assert_eq!(readings["CH2_current"], 0.97);
    }

    #[tokio::test]
    async fn test_get_set_values_parses_prefixed_readback() {
        let (psu, _) = psu(json!({}), |cmd: &str| match cmd {
            "V1?" => Some("V1 5.000".to_string()),
            "I1?" => Some("I1 0.450".to_string()),
            "V2?" => Some("V2 12.000".to_string()),
            "I2?" => Some("I2 1.000".to_string()),
            _ => None,
        });

        let values = psu.get_set_values().await.unwrap();
        assert_eq!(values["CH1_set_voltage"], 5.0);
        assert_eq!(values["CH2_set_current"], 1.0);
    }

    #[tokio::test]
    async fn test_set_output_single_and_all() {
        let (psu, trace) = psu(json!({}), |_| None);

        psu.set_output(true, None).await.unwrap();
        psu.set_output(false, Some("CH2")).await.unwrap();

        assert_eq!(written(&trace), vec!["OPALL 1", "OP2 0"]);
    }

    #[tokio::test]
    async fn test_configure_programs_configured_channels_only() {
        let config = json!({
            "channels": {
                "CH1": {"voltage": 5.0, "current": 0.5}
            }
        });
        let (psu, trace) = psu(config, |_| None);
        psu.configure(None).await.unwrap();

        let w = written(&trace);
        assert_eq!(&w[..3], &["OPALL 0", "*RST", "*CLS"]);
        assert!(w.contains(&"V1 5".to_string()));
        assert!(w.contains(&"I1 0.5".to_string()));
        assert!(w.iter().all(|c| !c.starts_with("V2") && !c.starts_with("I2")));
    }
}
