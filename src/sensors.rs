// Plant sensor seam
// One snapshot per report interval: air probe (temperature, humidity) plus
// the soil probe (resistivity and temperature). The heat index is derived
// locally so the backend stores what the plant actually experienced.

/// Raw readings from the probes, before the derived fields.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurements {
    pub air_temperature_celsius: f32,
    pub air_humidity_percentage: f32,
    pub soil_temperature_celsius: f32,
    pub soil_resistivity_raw: u16,
}

/// Measurement is infallible at this seam: a detached probe reads as an
/// implausible constant, and the backend is the right place to notice that.
pub trait PlantSensor {
    fn measure(&mut self) -> Measurements;
}

/// NOAA heat index (Rothfusz regression), computed in Fahrenheit and
/// converted back. Below the regression's range the simpler Steadman
/// approximation applies.
pub fn heat_index_celsius(temperature_celsius: f32, humidity_percentage: f32) -> f32 {
    let t = temperature_celsius * 9.0 / 5.0 + 32.0;
    let r = humidity_percentage;

    let mut hi = 0.5 * (t + 61.0 + (t - 68.0) * 1.2 + r * 0.094);
    if hi >= 80.0 {
        hi = -42.379 + 2.049_015_2 * t + 10.143_331 * r
            - 0.224_755_41 * t * r
            - 0.006_837_83 * t * t
            - 0.054_817_17 * r * r
            + 0.001_228_74 * t * t * r
            + 0.000_852_82 * t * r * r
            - 0.000_001_99 * t * t * r * r;

        if r < 13.0 && (80.0..=112.0).contains(&t) {
            hi -= ((13.0 - r) / 4.0) * (((17.0 - (t - 95.0).abs()) / 17.0).sqrt());
        } else if r > 85.0 && (80.0..=87.0).contains(&t) {
            hi += ((r - 85.0) / 10.0) * ((87.0 - t) / 5.0);
        }
    }

    (hi - 32.0) * 5.0 / 9.0
}
