// Onboard probes
// Air temperature and humidity come from an SHT40 on the I2C bus; the soil
// probes hang off ADC1 and are powered only while sampling so they do not
// electrolyze in the pot. Measurement never fails at this seam: a dead probe
// reads as an implausible constant and the backend notices the fault.

use anyhow::{Context, Result};
use esp_idf_svc::hal::adc::attenuation::DB_11;
use esp_idf_svc::hal::adc::oneshot::config::AdcChannelConfig;
use esp_idf_svc::hal::adc::oneshot::{AdcChannelDriver, AdcDriver};
use esp_idf_svc::hal::adc::ADC1;
use esp_idf_svc::hal::delay::FreeRtos;
use esp_idf_svc::hal::gpio::{Gpio25, Gpio34, Gpio35, Output, PinDriver};
use esp_idf_svc::hal::i2c::{I2cConfig, I2cDriver};
use esp_idf_svc::hal::prelude::*;
use log::warn;

use crate::sensors::{Measurements, PlantSensor};

const SHT40_ADDR: u8 = 0x44;
const SHT40_MEASURE_HIGH_PRECISION: u8 = 0xFD;

const SAMPLES: usize = 3;
const PROBE_SETTLE_MS: u32 = 50;

// Dead probes read as implausible but finite values; NaN would poison the
// JSON encoding of the whole event.
const FAULT_CELSIUS: f32 = -273.15;
const FAULT_HUMIDITY: f32 = -1.0;

// 10k NTC divider against 3.3V on the soil temperature channel.
const NTC_BETA: f32 = 3950.0;
const NTC_R0_OHM: f32 = 10_000.0;
const NTC_T0_KELVIN: f32 = 298.15;
const DIVIDER_R_OHM: f32 = 10_000.0;
const ADC_FULL_SCALE_MV: f32 = 3300.0;

type SoilChannel = AdcChannelDriver<'static, Gpio34, std::rc::Rc<AdcDriver<'static, ADC1>>>;
type NtcChannel = AdcChannelDriver<'static, Gpio35, std::rc::Rc<AdcDriver<'static, ADC1>>>;

pub struct OnboardSensors {
    i2c: I2cDriver<'static>,
    soil_resistivity: SoilChannel,
    soil_temperature: NtcChannel,
    probe_power: PinDriver<'static, Gpio25, Output>,
}

impl OnboardSensors {
    pub fn new(
        i2c: esp_idf_svc::hal::i2c::I2C0,
        sda: esp_idf_svc::hal::gpio::Gpio21,
        scl: esp_idf_svc::hal::gpio::Gpio22,
        adc: ADC1,
        soil_pin: Gpio34,
        ntc_pin: Gpio35,
        power_pin: Gpio25,
    ) -> Result<Self> {
        let i2c_config = I2cConfig::new().baudrate(100u32.kHz().into());
        let i2c = I2cDriver::new(i2c, sda, scl, &i2c_config).context("opening I2C bus")?;

        let channel_config = AdcChannelConfig {
            attenuation: DB_11,
            calibration: true,
            ..Default::default()
        };
        // Both soil channels share the ADC unit.
        let adc = std::rc::Rc::new(AdcDriver::new(adc).context("opening ADC1")?);
        let soil_resistivity =
            AdcChannelDriver::new(std::rc::Rc::clone(&adc), soil_pin, &channel_config)
                .context("opening soil resistivity channel")?;
        let soil_temperature = AdcChannelDriver::new(adc, ntc_pin, &channel_config)
            .context("opening soil temperature channel")?;

        let probe_power = PinDriver::output(power_pin).context("claiming probe power pin")?;

        Ok(Self {
            i2c,
            soil_resistivity,
            soil_temperature,
            probe_power,
        })
    }

    fn read_air(&mut self) -> Result<(f32, f32)> {
        self.i2c
            .write(SHT40_ADDR, &[SHT40_MEASURE_HIGH_PRECISION], 100)
            .context("triggering SHT40 measurement")?;
        FreeRtos::delay_ms(10);

        let mut raw = [0u8; 6];
        self.i2c
            .read(SHT40_ADDR, &mut raw, 100)
            .context("reading SHT40 measurement")?;

        let t_raw = u16::from_be_bytes([raw[0], raw[1]]) as f32;
        let rh_raw = u16::from_be_bytes([raw[3], raw[4]]) as f32;
        let temperature = -45.0 + 175.0 * t_raw / 65535.0;
        let humidity = (-6.0 + 125.0 * rh_raw / 65535.0).clamp(0.0, 100.0);
        Ok((temperature, humidity))
    }

    fn averaged_mv(channel: &mut dyn FnMut() -> Result<u16>) -> Result<f32> {
        let mut sum = 0u32;
        for _ in 0..SAMPLES {
            sum += u32::from(channel()?);
            FreeRtos::delay_ms(10);
        }
        Ok(sum as f32 / SAMPLES as f32)
    }

    fn read_soil(&mut self) -> Result<(u16, f32)> {
        self.probe_power.set_high().context("powering soil probes")?;
        FreeRtos::delay_ms(PROBE_SETTLE_MS);

        let resistivity = {
            let channel = &mut self.soil_resistivity;
            Self::averaged_mv(&mut || {
                channel
                    .read()
                    .context("reading soil resistivity")
            })?
        };
        let ntc_mv = {
            let channel = &mut self.soil_temperature;
            Self::averaged_mv(&mut || channel.read().context("reading soil NTC"))?
        };

        if let Err(err) = self.probe_power.set_low() {
            warn!("Failed to power down the soil probes: {}", err);
        }

        Ok((resistivity as u16, ntc_celsius(ntc_mv)))
    }
}

fn ntc_celsius(millivolts: f32) -> f32 {
    if millivolts <= 0.0 || millivolts >= ADC_FULL_SCALE_MV {
        return FAULT_CELSIUS;
    }
    let resistance = DIVIDER_R_OHM * millivolts / (ADC_FULL_SCALE_MV - millivolts);
    let inv_kelvin = 1.0 / NTC_T0_KELVIN + (resistance / NTC_R0_OHM).ln() / NTC_BETA;
    1.0 / inv_kelvin - 273.15
}

impl PlantSensor for OnboardSensors {
    fn measure(&mut self) -> Measurements {
        let (air_temperature_celsius, air_humidity_percentage) = match self.read_air() {
            Ok(air) => air,
            Err(err) => {
                warn!("Air probe read failed: {:#}", err);
                (FAULT_CELSIUS, FAULT_HUMIDITY)
            }
        };
        let (soil_resistivity_raw, soil_temperature_celsius) = match self.read_soil() {
            Ok(soil) => soil,
            Err(err) => {
                warn!("Soil probe read failed: {:#}", err);
                (0, FAULT_CELSIUS)
            }
        };

        Measurements {
            air_temperature_celsius,
            air_humidity_percentage,
            soil_temperature_celsius,
            soil_resistivity_raw,
        }
    }
}
