use std::f32::consts::PI;

use crate::error::Result;
use crate::ov534_proto::{BridgeReg, GPIO_LED};
use crate::ov7725_proto::*;
use crate::pixel_format::PixelFormat;
use crate::registers::{ControlTransport, Registers};
use crate::BIT_5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SizeMode {
    /// 640x480
    Vga,
    /// 320x240
    Qvga,
}

impl SizeMode {
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            SizeMode::Vga => (640, 480),
            SizeMode::Qvga => (320, 240),
        }
    }

    /// Anything but 320 pixels wide is treated as VGA.
    pub fn from_width(width: u32) -> SizeMode {
        if width != 320 { SizeMode::Vga } else { SizeMode::Qvga }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRateInfo {
    pub fps: u32,
    pub clock_scale: u8,
    pub com4: u8,
    pub camera_clock: u8,
}

const fn rate(fps: u32, clock_scale: u8, pll: u8, camera_clock: u8) -> FrameRateInfo {
    FrameRateInfo { fps, clock_scale, com4: pll | COM4_AEC_FULL_WINDOW, camera_clock }
}

/// Descending by fps.
pub static SUPPORTED_RATES_VGA: &[FrameRateInfo] = &[
    rate(83, 0x01, COM4_PLL_8X, 0x02), // 83 fps and up: video is partly corrupt
    rate(75, 0x01, COM4_PLL_6X, 0x02), // 75 fps or below: video is valid
    rate(60, 0x00, COM4_PLL_4X, 0x04),
    rate(50, 0x01, COM4_PLL_4X, 0x02),
    rate(40, 0x02, COM4_PLL_8X, 0x04),
    rate(30, 0x04, COM4_PLL_6X, 0x02),
    rate(25, 0x00, COM4_PLL_BYPASS, 0x02),
    rate(20, 0x04, COM4_PLL_4X, 0x02),
    rate(15, 0x09, COM4_PLL_6X, 0x02),
    rate(10, 0x09, COM4_PLL_4X, 0x02),
    rate(8, 0x02, COM4_PLL_BYPASS, 0x02),
    rate(5, 0x04, COM4_PLL_BYPASS, 0x02),
    rate(3, 0x06, COM4_PLL_BYPASS, 0x02),
    rate(2, 0x09, COM4_PLL_BYPASS, 0x02),
];

/// Descending by fps.
pub static SUPPORTED_RATES_QVGA: &[FrameRateInfo] = &[
    rate(290, 0x00, COM4_PLL_8X, 0x04),
    rate(205, 0x01, COM4_PLL_8X, 0x02), // 205 fps and up: video is partly corrupt
    rate(187, 0x01, COM4_PLL_6X, 0x02), // 187 fps or below: video is valid
    rate(150, 0x00, COM4_PLL_4X, 0x04),
    rate(137, 0x02, COM4_PLL_8X, 0x02),
    rate(125, 0x01, COM4_PLL_4X, 0x02),
    rate(100, 0x02, COM4_PLL_8X, 0x04),
    rate(90, 0x03, COM4_PLL_6X, 0x02),
    rate(75, 0x04, COM4_PLL_6X, 0x02),
    rate(60, 0x04, COM4_PLL_8X, 0x04),
    rate(50, 0x04, COM4_PLL_4X, 0x02),
    rate(40, 0x06, COM4_PLL_6X, 0x03),
    rate(37, 0x00, COM4_PLL_BYPASS, 0x04),
    rate(30, 0x04, COM4_PLL_4X, 0x04),
    rate(17, 0x18, COM4_PLL_8X, 0x02),
    rate(15, 0x18, COM4_PLL_6X, 0x02),
    rate(12, 0x02, COM4_PLL_BYPASS, 0x04),
    rate(10, 0x18, COM4_PLL_4X, 0x02),
    rate(7, 0x04, COM4_PLL_BYPASS, 0x04),
    rate(5, 0x06, COM4_PLL_BYPASS, 0x04),
    rate(3, 0x09, COM4_PLL_BYPASS, 0x04),
    rate(2, 0x18, COM4_PLL_BYPASS, 0x02),
];

pub fn supported_rates(mode: SizeMode) -> &'static [FrameRateInfo] {
    match mode {
        SizeMode::Vga => SUPPORTED_RATES_VGA,
        SizeMode::Qvga => SUPPORTED_RATES_QVGA,
    }
}

/// First rate not above `desired`, or the slowest one.
pub fn find_closest(rates: &[FrameRateInfo], desired: u32) -> &FrameRateInfo {
    // tables are never empty
    rates
        .iter()
        .find(|info| info.fps <= desired)
        .unwrap_or(&rates[rates.len() - 1])
}

pub fn find_valid_frame_rate(mode: SizeMode, desired_fps: u32) -> u32 {
    find_closest(supported_rates(mode), desired_fps).fps
}

/// Low-level state of the camera.
///
/// Mode and format only change while the stream is stopped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceState {
    pub mode: SizeMode,
    /// see [`find_valid_frame_rate`] for valid options
    pub rate: u32,
    pub format: PixelFormat,
    pub enable_auto_gain: bool,
    pub enable_auto_white_balance: bool,
    pub gain: u8,
    pub exposure: u8,
    pub denoise_threshold: u8,
    /// 128 leaves hue untouched; the full range spans one turn.
    pub hue: u8,
    pub brightness: u8,
    pub contrast: u8,
    pub saturation: u8,
    pub blue_blc: u8,
    pub red_blc: u8,
    pub green_blc: u8,
    pub flip_h: bool,
    pub flip_v: bool,
    pub enable_test_pattern: bool,
}

impl Default for DeviceState {
    fn default() -> Self {
        DeviceState {
            mode: SizeMode::Vga,
            rate: 60,
            format: PixelFormat::Bayer8,
            enable_auto_gain: true,
            enable_auto_white_balance: true,
            gain: 0,
            exposure: 64,
            denoise_threshold: 0,
            hue: 128,
            brightness: 0,
            contrast: 64,
            saturation: 64,
            blue_blc: 128,
            red_blc: 128,
            green_blc: 128,
            flip_h: false,
            flip_v: false,
            enable_test_pattern: false,
        }
    }
}

impl DeviceState {
    pub fn new(mode: SizeMode, rate: u32, format: PixelFormat) -> DeviceState {
        DeviceState { mode, rate, format, ..Default::default() }
    }

    pub fn width(&self) -> u32 {
        self.mode.dimensions().0
    }

    pub fn height(&self) -> u32 {
        self.mode.dimensions().1
    }

    pub fn frame_size(&self) -> usize {
        self.format.size_bytes(self.width() as usize, self.height() as usize)
    }

    pub fn set_mode(&mut self, mode: SizeMode) -> &mut Self {
        self.mode = mode;
        self
    }

    pub fn set_rate(&mut self, fps: u32) -> &mut Self {
        self.rate = fps;
        self
    }

    pub fn set_format(&mut self, format: PixelFormat) -> &mut Self {
        self.format = format;
        self
    }

    pub fn set_flip(&mut self, horizontal: bool, vertical: bool) -> &mut Self {
        self.flip_h = horizontal;
        self.flip_v = vertical;
        self
    }

    /// True if going from `self` to `other` needs the stream restarted.
    pub fn needs_restart(&self, other: &DeviceState) -> bool {
        self.mode != other.mode || self.format != other.format
    }
}

/// Returns the rate actually programmed.
pub fn set_frame_rate<T: ControlTransport>(regs: &Registers<T>, mode: SizeMode, desired_fps: u32) -> Result<u32> {
    let info = find_closest(supported_rates(mode), desired_fps);
    sink_debug!(
        regs.log(),
        "setting frame rate to {}: {} {} {}",
        info.fps,
        info.clock_scale,
        info.com4,
        info.camera_clock
    );
    regs.write_sensor(SensorReg::ClockControl, info.clock_scale)?;
    regs.write_sensor(SensorReg::Com4, info.com4)?;
    regs.write_bridge(BridgeReg::CameraClock, info.camera_clock)?;
    Ok(info.fps)
}

pub fn set_camera_led_status<T: ControlTransport>(regs: &Registers<T>, on: bool) -> Result<()> {
    // gpio_c0 selects the LED bit, gpio_v0 carries its value
    regs.write_bridge(BridgeReg::GpioC0, GPIO_LED)?;
    regs.write_bridge(BridgeReg::GpioV0, if on { GPIO_LED } else { 0 })
}

pub fn set_automatic_gain<T: ControlTransport>(regs: &Registers<T>, on: bool) -> Result<()> {
    const DEFAULT_VALUE: u8 = COM8_ENABLE_FAST_AGC_AEC
        | COM8_AEC_STEP_SIZE_VBLANK
        | COM8_ENABLE_BANDING_FILTER
        | COM8_ENABLE_AEC_BELOW_BANDING;
    const DEFECT_CORRECTION: u8 = DSP_CTRL1_AUTO_CORRECT_BLACK_DEFECT | DSP_CTRL1_AUTO_CORRECT_WHITE_DEFECT;

    if on {
        regs.write_sensor(SensorReg::Com8, DEFAULT_VALUE | COM8_ENABLE_AGC | COM8_ENABLE_AWB | COM8_ENABLE_AEC)?;
        let dsp = regs.read_sensor(SensorReg::DspCtrl1)?;
        regs.write_sensor(SensorReg::DspCtrl1, dsp | DEFECT_CORRECTION)
    } else {
        regs.write_sensor(SensorReg::Com8, DEFAULT_VALUE)?;
        let dsp = regs.read_sensor(SensorReg::DspCtrl1)?;
        regs.write_sensor(SensorReg::DspCtrl1, dsp & !DEFECT_CORRECTION)
    }
}

pub fn set_auto_white_balance<T: ControlTransport>(regs: &Registers<T>, on: bool) -> Result<()> {
    const WBC_THRESHOLD_2: u8 = 10;
    // bit 5 is set by every known driver, meaning unknown
    let value = if on {
        AWB_CTRL0_ENABLE_AWB_GAIN | AWB_CTRL0_CALCULATE_AWB | BIT_5
    } else {
        AWB_CTRL0_ENABLE_AWB_GAIN | BIT_5 | WBC_THRESHOLD_2
    };
    regs.write_sensor(SensorReg::AwbCtrl0, value)
}

pub fn set_gain<T: ControlTransport>(regs: &Registers<T>, value: u8) -> Result<()> {
    regs.write_sensor(SensorReg::Gain, value)
}

pub fn set_exposure<T: ControlTransport>(regs: &Registers<T>, value: u16) -> Result<()> {
    regs.write_sensor(SensorReg::AecHigh, (value >> 7) as u8)?;
    regs.write_sensor(SensorReg::AecLow, (value << 1) as u8)
}

pub fn set_denoise_threshold<T: ControlTransport>(regs: &Registers<T>, value: u8) -> Result<()> {
    regs.write_sensor(SensorReg::DenoiseThreshCtrl, value)?;
    regs.write_sensor(SensorReg::DenoiseThresh, value)
}

pub fn set_contrast_gain<T: ControlTransport>(regs: &Registers<T>, value: u8) -> Result<()> {
    regs.write_sensor(SensorReg::ContrastGain, value)
}

pub fn set_saturation_gain<T: ControlTransport>(regs: &Registers<T>, value: u8) -> Result<()> {
    regs.write_sensor(SensorReg::USat, value)?;
    regs.write_sensor(SensorReg::VSat, value)
}

pub fn set_brightness<T: ControlTransport>(regs: &Registers<T>, value: u8) -> Result<()> {
    regs.write_sensor(SensorReg::Brightness, value)
}

/// Rotation (cos, sin) applied by the sensor's hue stage.
///
/// `hue` maps to an angle of `(hue - 128) * PI / 128` radians, so 128 is no
/// rotation, 0 is -PI and 255 is just under PI. A rotation of `r` radians,
/// wrapped into [-PI, PI), is `hue = 128 + r * 128 / PI`; e.g. a raw angle of
/// 143 rad wraps to about -1.51 rad, which is hue 66.
pub fn hue_coefficients(hue: u8) -> (f32, f32) {
    let angle = (hue as f32 - 128.0) * PI / 128.0;
    (angle.cos(), angle.sin())
}

pub fn set_hue<T: ControlTransport>(regs: &Registers<T>, hue: u8) -> Result<()> {
    let (cos, sin) = hue_coefficients(hue);
    let hue_cos = (cos * 128.0) as i32;
    let mut hue_sin = (sin * 128.0) as i32;

    let sign_bits = regs.read_sensor(SensorReg::HueSign)?;
    if hue_sin < 0 {
        regs.write_sensor(SensorReg::HueSign, sign_bits | HUE_SIGN_NEGATIVE_SIN)?;
        hue_sin = -hue_sin;
    } else {
        regs.write_sensor(SensorReg::HueSign, sign_bits & !HUE_SIGN_NEGATIVE_SIN)?;
    }

    regs.write_sensor(SensorReg::HueCos, hue_cos as u8)?;
    regs.write_sensor(SensorReg::HueSin, hue_sin as u8)
}

pub fn set_red_balance_target<T: ControlTransport>(regs: &Registers<T>, value: u8) -> Result<()> {
    regs.write_sensor(SensorReg::TgtR, value)
}

pub fn set_blue_balance_target<T: ControlTransport>(regs: &Registers<T>, value: u8) -> Result<()> {
    regs.write_sensor(SensorReg::TgtB, value)
}

pub fn set_green_balance_target<T: ControlTransport>(regs: &Registers<T>, value: u8) -> Result<()> {
    // Gb only
    regs.write_sensor(SensorReg::TgtGb, value)
}

pub fn set_flip_and_test_pattern<T: ControlTransport>(
    regs: &Registers<T>,
    horizontal: bool,
    vertical: bool,
    test_pattern: bool,
) -> Result<()> {
    let mut value = regs.read_sensor(SensorReg::Com3)?;
    value &= !(COM3_VFLIP_IMAGE | COM3_HFLIP_IMAGE | COM3_ENABLE_TEST_PATTERN);
    if vertical {
        value |= COM3_VFLIP_IMAGE;
    }
    if horizontal {
        value |= COM3_HFLIP_IMAGE;
    }
    if test_pattern {
        value |= COM3_ENABLE_TEST_PATTERN;
    }
    regs.write_sensor(SensorReg::Com3, value)
}

/// Pushes every control in `state` to the device. The register traffic is a
/// pure function of `state` and the read-back bits it preserves.
pub fn apply_state<T: ControlTransport>(regs: &Registers<T>, state: &DeviceState) -> Result<()> {
    set_frame_rate(regs, state.mode, state.rate)?;
    set_automatic_gain(regs, state.enable_auto_gain)?;
    set_auto_white_balance(regs, state.enable_auto_white_balance)?;
    set_gain(regs, state.gain)?;
    set_exposure(regs, state.exposure as u16)?;
    set_denoise_threshold(regs, state.denoise_threshold)?;
    set_hue(regs, state.hue)?;
    set_brightness(regs, state.brightness)?;
    set_contrast_gain(regs, state.contrast)?;
    set_saturation_gain(regs, state.saturation)?;
    set_blue_balance_target(regs, state.blue_blc)?;
    set_red_balance_target(regs, state.red_blc)?;
    set_green_balance_target(regs, state.green_blc)?;
    set_flip_and_test_pattern(regs, state.flip_h, state.flip_v, state.enable_test_pattern)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use float_eq::float_eq;

    use super::*;
    use crate::config::StreamConfig;
    use crate::logger::{setup_logger, LogSink};
    use crate::testing::MockControl;

    fn setup() -> (Arc<MockControl>, Registers<Arc<MockControl>>) {
        setup_logger();
        let mock = Arc::new(MockControl::new());
        let regs = Registers::new(mock.clone(), &StreamConfig::immediate(), LogSink::global());
        (mock, regs)
    }

    #[test]
    fn frame_rate_resolution_clamps_both_ends() {
        assert_eq!(find_valid_frame_rate(SizeMode::Vga, 62), 60);
        assert_eq!(find_valid_frame_rate(SizeMode::Vga, 1), 2);
        assert_eq!(find_valid_frame_rate(SizeMode::Vga, 1000), 83);
        assert_eq!(find_valid_frame_rate(SizeMode::Qvga, 1000), 290);
        assert_eq!(find_valid_frame_rate(SizeMode::Qvga, 0), 2);
        assert_eq!(find_valid_frame_rate(SizeMode::Qvga, 31), 30);
    }

    #[test]
    fn rate_tables_are_descending() {
        for rates in [SUPPORTED_RATES_VGA, SUPPORTED_RATES_QVGA] {
            assert!(rates.windows(2).all(|w| w[0].fps > w[1].fps));
        }
    }

    #[test]
    fn frame_rate_programs_sensor_and_bridge() {
        let (mock, regs) = setup();
        assert_eq!(set_frame_rate(&regs, SizeMode::Qvga, 45).unwrap(), 40);
        assert_eq!(
            mock.sensor_writes(),
            vec![(SensorReg::ClockControl as u8, 0x06), (SensorReg::Com4 as u8, COM4_PLL_6X)]
        );
        assert_eq!(mock.bridge(BridgeReg::CameraClock), 0x03);
    }

    #[test]
    fn applying_same_state_twice_repeats_the_same_traffic() {
        let (mock, regs) = setup();
        let state = DeviceState { hue: 40, flip_v: true, enable_auto_gain: false, ..Default::default() };

        apply_state(&regs, &state).unwrap();
        let first = mock.ops();
        mock.clear_ops();
        apply_state(&regs, &state).unwrap();
        assert_eq!(mock.ops(), first);
    }

    #[test]
    fn led_uses_gpio_bit_seven() {
        let (mock, regs) = setup();
        set_camera_led_status(&regs, true).unwrap();
        set_camera_led_status(&regs, false).unwrap();
        assert_eq!(mock.writes(), vec![(0x21, 0x80), (0x23, 0x80), (0x21, 0x80), (0x23, 0x00)]);
    }

    #[test]
    fn auto_gain_toggles_defect_correction() {
        let (mock, regs) = setup();
        mock.set_sensor(SensorReg::DspCtrl1, 0x40);
        set_automatic_gain(&regs, true).unwrap();
        assert_eq!(mock.sensor(SensorReg::Com8), 0xf7);
        assert_eq!(mock.sensor(SensorReg::DspCtrl1), 0x43);
        set_automatic_gain(&regs, false).unwrap();
        assert_eq!(mock.sensor(SensorReg::Com8), 0xf0);
        assert_eq!(mock.sensor(SensorReg::DspCtrl1), 0x40);
    }

    #[test]
    fn exposure_is_split_across_two_registers() {
        let (mock, regs) = setup();
        set_exposure(&regs, 0xc3).unwrap();
        assert_eq!(mock.sensor(SensorReg::AecHigh), 0x01);
        assert_eq!(mock.sensor(SensorReg::AecLow), 0x86);
    }

    #[test]
    fn hue_sign_bit_follows_sine() {
        let (mock, regs) = setup();
        mock.set_sensor(SensorReg::HueSign, 0x01);

        set_hue(&regs, 128).unwrap();
        assert_eq!(mock.sensor(SensorReg::HueCos), 0x80);
        assert_eq!(mock.sensor(SensorReg::HueSin), 0);
        assert_eq!(mock.sensor(SensorReg::HueSign), 0x01);

        set_hue(&regs, 64).unwrap();
        assert_eq!(mock.sensor(SensorReg::HueCos), 0);
        assert_eq!(mock.sensor(SensorReg::HueSin), 0x80);
        assert_eq!(mock.sensor(SensorReg::HueSign), 0x03);
    }

    #[test]
    fn hue_coefficients_cover_one_turn() {
        let (c, s) = hue_coefficients(192);
        assert!(float_eq!(c, 0.0, abs <= 0.000_1));
        assert!(float_eq!(s, 1.0, abs <= 0.000_1));
        let (c, _) = hue_coefficients(0);
        assert!(float_eq!(c, -1.0, abs <= 0.000_1));
    }

    #[test]
    fn hue_matches_radian_angle() {
        let (c, s) = hue_coefficients(66);
        assert!(float_eq!(c, 143.0f32.cos(), abs <= 0.02));
        assert!(float_eq!(s, 143.0f32.sin(), abs <= 0.02));
    }

    #[test]
    fn flip_keeps_unrelated_com3_bits() {
        let (mock, regs) = setup();
        mock.set_sensor(SensorReg::Com3, 0xd1);
        set_flip_and_test_pattern(&regs, true, false, false).unwrap();
        assert_eq!(mock.sensor(SensorReg::Com3), 0x50);
    }

    #[test]
    fn restart_needed_only_for_mode_or_format() {
        let a = DeviceState::default();
        let mut b = a;
        b.set_rate(30).set_flip(true, true);
        assert!(!a.needs_restart(&b));
        b.set_mode(SizeMode::Qvga);
        assert!(a.needs_restart(&b));
        assert_eq!(b.frame_size(), 320 * 240);
    }
}
