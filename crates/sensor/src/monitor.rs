//! Monitor de ambiente – gera as leituras enviadas ao servidor.
//!
//! A temperatura vem dos sensores térmicos da máquina (`sysinfo`) quando
//! disponível; o resto é sintético dentro de faixas plausíveis.

use envmon_core::types::SensorPayload;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::ops::Range;
use sysinfo::Components;
use tracing::{debug, info};

const TEMPERATURE_RANGE: Range<f64> = 20.0..50.0;
const HUMIDITY_RANGE: Range<f64> = 30.0..60.0;
const SMOKE_RANGE: Range<f64> = 500.0..1500.0;
const NOISE_RANGE: Range<f64> = 20.0..160.0;

/// Fonte das leituras do sensor.
pub struct SensorMonitor {
    components: Option<Components>,
    rng: StdRng,
}

impl SensorMonitor {
    /// `use_host_temperature = false` ignora os sensores da máquina.
    pub fn new(use_host_temperature: bool) -> Self {
        let components = use_host_temperature.then(Components::new_with_refreshed_list);
        match &components {
            Some(c) if !c.is_empty() => info!("✓ {} sensor(es) térmico(s) detectado(s)", c.len()),
            Some(_) => info!("✗ Nenhum sensor térmico: temperatura sintética"),
            None => info!("Temperatura sintética (use_host_temperature = false)"),
        }

        Self {
            components,
            rng: StdRng::from_entropy(),
        }
    }

    /// Monitor só com valores sintéticos e semente fixa.
    #[cfg(test)]
    pub fn synthetic(seed: u64) -> Self {
        Self {
            components: None,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Gera uma leitura completa.
    pub fn collect(&mut self) -> SensorPayload {
        let temperature_val = match self.host_temperature() {
            Some(t) => round2(t),
            None => self.sample(TEMPERATURE_RANGE),
        };

        SensorPayload {
            temperature_val,
            humidity_val: self.sample(HUMIDITY_RANGE),
            smoke_val: self.sample(SMOKE_RANGE),
            noise_val: self.sample(NOISE_RANGE),
        }
    }

    /// Maior temperatura plausível entre os sensores da máquina.
    fn host_temperature(&mut self) -> Option<f64> {
        let components = self.components.as_mut()?;
        components.refresh(true);

        let mut temp: Option<f32> = None;
        for comp in components.iter() {
            if let Some(t) = comp.temperature() {
                if t > 0.0 && t < 150.0 && temp.is_none_or(|best| t > best) {
                    temp = Some(t);
                }
            }
        }
        if temp.is_none() {
            debug!("Sensores térmicos sem leitura válida");
        }
        temp.map(f64::from)
    }

    fn sample(&mut self, range: Range<f64>) -> f64 {
        round2(self.rng.gen_range(range))
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
