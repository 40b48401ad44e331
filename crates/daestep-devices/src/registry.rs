//! Device-kind registry: maps kind identifiers to factory functions.

use indexmap::IndexMap;

use daestep_core::NodeId;

use crate::device::BoxedDevice;
use crate::diode::{Diode, DiodeParams};
use crate::error::{Error, Result};
use crate::passive::{Capacitor, Inductor, Resistor};
use crate::sources::{CurrentSource, VoltageSource};
use crate::waveforms::Waveform;

/// Everything a factory needs to build one device instance.
#[derive(Debug, Clone)]
pub struct DeviceSpec {
    pub name: String,
    pub nodes: Vec<NodeId>,
    /// Named numeric parameters, in declaration order.
    pub params: IndexMap<String, f64>,
    pub waveform: Option<Waveform>,
}

impl DeviceSpec {
    pub fn new(name: impl Into<String>, nodes: impl Into<Vec<NodeId>>) -> Self {
        Self {
            name: name.into(),
            nodes: nodes.into(),
            params: IndexMap::new(),
            waveform: None,
        }
    }

    /// Builder-style parameter setter.
    pub fn param(mut self, key: impl Into<String>, value: f64) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn with_waveform(mut self, waveform: Waveform) -> Self {
        self.waveform = Some(waveform);
        self
    }

    /// Required parameter.
    pub fn require(&self, key: &str) -> Result<f64> {
        self.params
            .get(key)
            .copied()
            .ok_or_else(|| Error::MissingParameter {
                device: self.name.clone(),
                param: key.to_string(),
            })
    }

    /// Required parameter that must be finite and strictly positive.
    pub fn require_positive(&self, key: &str) -> Result<f64> {
        let value = self.require(key)?;
        if value > 0.0 && value.is_finite() {
            Ok(value)
        } else {
            Err(Error::InvalidParameter {
                device: self.name.clone(),
                param: key.to_string(),
                value,
            })
        }
    }

    /// Optional parameter with a default.
    pub fn get_or(&self, key: &str, default: f64) -> f64 {
        self.params.get(key).copied().unwrap_or(default)
    }

    /// The two terminals of a two-terminal device.
    pub fn two_nodes(&self) -> Result<(NodeId, NodeId)> {
        match self.nodes.as_slice() {
            [a, b] => Ok((*a, *b)),
            other => Err(Error::WrongNodeCount {
                device: self.name.clone(),
                expected: 2,
                actual: other.len(),
            }),
        }
    }

    /// Waveform if given, else a DC source from the `value` parameter.
    fn source_waveform(&self) -> Result<Waveform> {
        let waveform = match &self.waveform {
            Some(w) => w.clone(),
            None => Waveform::dc(self.require("value")?),
        };
        waveform.validate()?;
        Ok(waveform)
    }
}

/// Factory building a device from its spec.
pub type DeviceFactory = fn(&DeviceSpec) -> Result<BoxedDevice>;

/// Registry of device kinds.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    factories: IndexMap<String, DeviceFactory>,
}

impl DeviceRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in kinds R, C, L, V, I and D.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("R", build_resistor);
        registry.register("C", build_capacitor);
        registry.register("L", build_inductor);
        registry.register("V", build_voltage_source);
        registry.register("I", build_current_source);
        registry.register("D", build_diode);
        registry
    }

    /// Register (or replace) a kind. Kinds are case-insensitive.
    pub fn register(&mut self, kind: &str, factory: DeviceFactory) {
        self.factories.insert(kind.to_ascii_uppercase(), factory);
    }

    /// Build a device of `kind`.
    pub fn create(&self, kind: &str, spec: &DeviceSpec) -> Result<BoxedDevice> {
        let factory = self
            .factories
            .get(&kind.to_ascii_uppercase())
            .ok_or_else(|| Error::UnknownKind(kind.to_string()))?;
        log::debug!("creating {} device {}", kind, spec.name);
        factory(spec)
    }

    /// Registered kinds, in registration order.
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(&kind.to_ascii_uppercase())
    }
}

fn build_resistor(spec: &DeviceSpec) -> Result<BoxedDevice> {
    let (a, b) = spec.two_nodes()?;
    let r = spec.require_positive("r")?;
    Ok(Box::new(Resistor::new(spec.name.clone(), a, b, r)))
}

fn build_capacitor(spec: &DeviceSpec) -> Result<BoxedDevice> {
    let (a, b) = spec.two_nodes()?;
    let c = spec.require_positive("c")?;
    Ok(Box::new(Capacitor::new(spec.name.clone(), a, b, c)))
}

fn build_inductor(spec: &DeviceSpec) -> Result<BoxedDevice> {
    let (a, b) = spec.two_nodes()?;
    let l = spec.require_positive("l")?;
    Ok(Box::new(Inductor::new(spec.name.clone(), a, b, l)))
}

fn build_voltage_source(spec: &DeviceSpec) -> Result<BoxedDevice> {
    let (a, b) = spec.two_nodes()?;
    Ok(Box::new(VoltageSource::new(
        spec.name.clone(),
        a,
        b,
        spec.source_waveform()?,
    )))
}

fn build_current_source(spec: &DeviceSpec) -> Result<BoxedDevice> {
    let (a, b) = spec.two_nodes()?;
    Ok(Box::new(CurrentSource::new(
        spec.name.clone(),
        a,
        b,
        spec.source_waveform()?,
    )))
}

fn build_diode(spec: &DeviceSpec) -> Result<BoxedDevice> {
    let (a, b) = spec.two_nodes()?;
    let defaults = DiodeParams::default();
    let params = DiodeParams {
        is: spec.get_or("is", defaults.is),
        n: spec.get_or("n", defaults.n),
        cj0: spec.get_or("cj0", defaults.cj0),
        tt: spec.get_or("tt", defaults.tt),
        gmin: spec.get_or("gmin", defaults.gmin),
        temp: spec.get_or("temp", defaults.temp),
    };
    for (param, value) in [("is", params.is), ("n", params.n), ("temp", params.temp)] {
        if value <= 0.0 || !value.is_finite() {
            return Err(Error::InvalidParameter {
                device: spec.name.clone(),
                param: param.to_string(),
                value,
            });
        }
    }
    Ok(Box::new(Diode::with_params(spec.name.clone(), a, b, params)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(i: u32) -> NodeId {
        NodeId::new(i)
    }

    #[test]
    fn test_builtins_registered() {
        let reg = DeviceRegistry::with_builtins();
        let kinds: Vec<&str> = reg.kinds().collect();
        assert_eq!(kinds, vec!["R", "C", "L", "V", "I", "D"]);
        assert!(reg.contains("r"));
    }

    #[test]
    fn test_create_resistor() {
        let reg = DeviceRegistry::with_builtins();
        let spec = DeviceSpec::new("R1", [n(1), n(0)]).param("r", 1e3);
        let dev = reg.create("r", &spec).unwrap();
        assert_eq!(dev.name(), "R1");
        assert_eq!(dev.num_locals(), 2);
    }

    #[test]
    fn test_unknown_kind() {
        let reg = DeviceRegistry::with_builtins();
        let spec = DeviceSpec::new("Q1", [n(1), n(2)]);
        assert!(matches!(reg.create("Q", &spec), Err(Error::UnknownKind(_))));
    }

    #[test]
    fn test_missing_and_invalid_parameters() {
        let reg = DeviceRegistry::with_builtins();
        let spec = DeviceSpec::new("C1", [n(1), n(0)]);
        assert!(matches!(
            reg.create("C", &spec),
            Err(Error::MissingParameter { .. })
        ));
        let spec = DeviceSpec::new("R1", [n(1), n(0)]).param("r", 0.0);
        assert!(matches!(
            reg.create("R", &spec),
            Err(Error::InvalidParameter { .. })
        ));
        let spec = DeviceSpec::new("R1", [n(1)]).param("r", 1.0);
        assert!(matches!(
            reg.create("R", &spec),
            Err(Error::WrongNodeCount { actual: 1, .. })
        ));
    }

    #[test]
    fn test_source_with_waveform() {
        let reg = DeviceRegistry::with_builtins();
        let spec = DeviceSpec::new("V1", [n(1), n(0)])
            .with_waveform(Waveform::pulse(0.0, 1.0, 1e-3, 1e-6, 1e-6, 1e-3, 0.0));
        let dev = reg.create("V", &spec).unwrap();
        assert_eq!(dev.num_internal_unknowns(), 1);
        assert_eq!(dev.breakpoints(0.0, 1.0).len(), 4);
    }
}
