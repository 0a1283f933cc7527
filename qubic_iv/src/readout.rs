//! Conversion from raw ADU readings to physical TES quantities.

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::quality::Verdict;
use crate::{reciprocal_or_cap, ZERO_EPSILON};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReadoutCalibration {
    /// Ohms.
    pub feedback_resistance: f64,
    pub fll_gain_factor: f64,
    /// Volts per ADU.
    pub adc_lsb_volt: f64,
    /// Samples summed into one reading.
    pub samples_per_reading: usize,
    pub masked_samples: usize,
    /// Ohms.
    pub shunt_resistance: f64,
    /// Ohms.
    pub bias_resistance: f64,
}

impl Default for ReadoutCalibration {
    fn default() -> Self {
        Self {
            feedback_resistance: 10e3,
            fll_gain_factor: 10.4 / 0.2,
            adc_lsb_volt: 2.5 / 65536.0,
            samples_per_reading: 100,
            masked_samples: 0,
            shunt_resistance: 10e-3,
            bias_resistance: 10e3,
        }
    }
}

impl ReadoutCalibration {
    /// Current in µA for one summed ADU reading.
    pub fn adu_to_current(&self, adu: f64) -> f64 {
        let summed = self
            .samples_per_reading
            .saturating_sub(self.masked_samples)
            .max(1) as f64;
        1e6 * adu * self.adc_lsb_volt
            / (self.fll_gain_factor * self.feedback_resistance)
            / summed
    }

    pub fn convert_matrix(&self, adu: &Array2<f64>) -> Array2<f64> {
        adu.mapv(|v| self.adu_to_current(v))
    }

    /// TES voltage in µV for a bias voltage and a TES current in µA.
    pub fn tes_voltage(&self, bias: f64, current_ua: f64) -> f64 {
        1e6 * self.shunt_resistance * (bias / self.bias_resistance - current_ua * 1e-6)
    }

    /// Normal resistance in ohms from the dynamic resistance R1 (bias volts per µA).
    pub fn normal_resistance(&self, r1: f64) -> f64 {
        self.shunt_resistance * (r1 * 1e6 / self.bias_resistance - 1.0)
    }
}

/// Adjusted I-V curve of one channel with the derived TES quantities.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct TesCurve {
    pub bias: Vec<f64>,
    /// µA, offset applied.
    pub current: Vec<f64>,
    /// µV.
    pub voltage: Vec<f64>,
    /// pW.
    pub power: Vec<f64>,
    /// Ohms.
    pub resistance: Vec<f64>,
}

pub fn tes_curve(
    bias: &[f64],
    current: &[f64],
    offset: f64,
    readout: &ReadoutCalibration,
) -> TesCurve {
    let mut curve = TesCurve::default();
    for (&v, &i) in bias.iter().zip(current.iter()) {
        let adjusted = i + offset;
        let voltage = readout.tes_voltage(v, adjusted);
        curve.bias.push(v);
        curve.current.push(adjusted);
        curve.voltage.push(voltage);
        curve.power.push(voltage * adjusted);
        curve.resistance.push(voltage * reciprocal_or_cap(adjusted, ZERO_EPSILON));
    }
    curve
}

/// Normal resistance of a good channel, from the R1 of its fit.
pub fn normal_resistance(verdict: &Verdict, readout: &ReadoutCalibration) -> Option<f64> {
    if !verdict.is_good {
        return None;
    }
    verdict.fit.r1().map(|r1| readout.normal_resistance(r1))
}
