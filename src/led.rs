//! Demo LED device: a simple brightness actuator.
//!
//! The reference device behind the end-to-end tests. Brightness is clamped
//! to the 0..=100 percent range; an auto-measure flag can be toggled by a
//! peer that wants the LED to follow a distance sensor.

use crate::capability::Capability;
use crate::config::Settings;
use crate::device::{Device, DeviceContext};
use crate::protocol::ParameterMap;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Wire name of the brightness value parameter.
pub const PARAM_BRIGHTNESS: &str = "SimpleDoubleParameter";

/// Shared LED state, cloneable so tests can observe it from outside.
#[derive(Clone, Default)]
pub struct LedState {
    brightness_percent: Arc<RwLock<f64>>,
    auto_measure: Arc<RwLock<bool>>,
}

impl LedState {
    /// Clamps `raw` into 0..=100 and stores it; returns the stored value.
    pub async fn set_brightness(&self, raw: f64) -> f64 {
        let clamped = raw.clamp(0.0, 100.0);
        *self.brightness_percent.write().await = clamped;
        clamped
    }

    pub async fn brightness(&self) -> f64 {
        *self.brightness_percent.read().await
    }

    pub async fn toggle_auto_measure(&self) -> bool {
        let mut flag = self.auto_measure.write().await;
        *flag = !*flag;
        *flag
    }

    pub async fn auto_measure(&self) -> bool {
        *self.auto_measure.read().await
    }
}

struct SetBrightness {
    state: LedState,
}

#[async_trait]
impl Capability for SetBrightness {
    async fn invoke(
        &self,
        parameters: ParameterMap,
        _ctx: Arc<DeviceContext>,
    ) -> Result<ParameterMap> {
        let raw = parameters
            .get(PARAM_BRIGHTNESS)
            .and_then(Value::as_f64)
            .ok_or_else(|| anyhow!("missing numeric parameter {PARAM_BRIGHTNESS}"))?;
        let stored = self.state.set_brightness(raw).await;

        let mut out = ParameterMap::new();
        out.insert(PARAM_BRIGHTNESS.to_string(), json!(stored));
        Ok(out)
    }
}

struct GetBrightness {
    state: LedState,
}

#[async_trait]
impl Capability for GetBrightness {
    async fn invoke(
        &self,
        _parameters: ParameterMap,
        _ctx: Arc<DeviceContext>,
    ) -> Result<ParameterMap> {
        let mut out = ParameterMap::new();
        out.insert(PARAM_BRIGHTNESS.to_string(), json!(self.state.brightness().await));
        Ok(out)
    }
}

struct ToggleAutoMeasure {
    state: LedState,
}

#[async_trait]
impl Capability for ToggleAutoMeasure {
    async fn invoke(
        &self,
        _parameters: ParameterMap,
        _ctx: Arc<DeviceContext>,
    ) -> Result<ParameterMap> {
        let mut out = ParameterMap::new();
        out.insert(
            "AutoMeasure".to_string(),
            json!(self.state.toggle_auto_measure().await),
        );
        Ok(out)
    }
}

/// Builds the LED device with its capabilities registered, returning the
/// shared state alongside it.
pub fn led_device(settings: Settings) -> (Device, LedState) {
    let state = LedState::default();
    let device = Device::builder("AndreiLed")
        .capability(
            "andrei_led_set_brightness",
            Arc::new(SetBrightness {
                state: state.clone(),
            }),
        )
        .capability(
            "andrei_led_get_brightness",
            Arc::new(GetBrightness {
                state: state.clone(),
            }),
        )
        .capability(
            "andrei_led_toggle_auto_measure",
            Arc::new(ToggleAutoMeasure {
                state: state.clone(),
            }),
        )
        .build(settings);
    (device, state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn brightness_is_clamped_to_percent_range() {
        let state = LedState::default();
        assert_eq!(state.set_brightness(150.0).await, 100.0);
        assert_eq!(state.brightness().await, 100.0);
        assert_eq!(state.set_brightness(-12.5).await, 0.0);
        assert_eq!(state.set_brightness(42.0).await, 42.0);
    }

    #[tokio::test]
    async fn auto_measure_toggles() {
        let state = LedState::default();
        assert!(!state.auto_measure().await);
        assert!(state.toggle_auto_measure().await);
        assert!(!state.toggle_auto_measure().await);
    }
}
