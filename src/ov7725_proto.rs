// OmniVision OV7725 image sensor, reached over SCCB through the bridge
use crate::{setting, RegisterSetting, BIT_0, BIT_1, BIT_2, BIT_3, BIT_4, BIT_5, BIT_6, BIT_7};

#[derive(Debug, Clone, Copy, FromPrimitive, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SensorReg {
    Gain = 0x00,
    GainBlue,
    GainRed,
    GainGreen,
    Reserved04,
    UBAvg,
    YGbAvg,
    VRAvg,
    AecHigh,
    Com2,
    Pid,
    Ver,
    Com3,
    Com4,
    Com5,
    Com6,
    AecLow,
    ClockControl,
    Com7,
    Com8,
    Com9,
    Com10,
    Reg16,
    HorizontalStart,
    HorizontalSize,
    VerticalStart,
    VerticalSize,
    PShift,
    ManufacturerIdHigh,
    ManufacturerIdLow,
    Reserved1e,
    FineAec,
    Com11,
    Reserved21,
    BdBase,
    BdMaxStep,
    Aew,
    Aeb,
    Vpt,
    Reserved27,
    Reg28,
    HOutSize,
    Exhch,
    Exhcl,
    VOutSize,
    Advfl,
    Advfh,
    Yave,
    LumHth,
    LumLth,
    Href,
    DmLnl,
    DmLnh,
    AdOffB,
    AdOffR,
    AdOffGb,
    AdOffGr,
    OffB,
    OffR,
    OffGb,
    OffGr,
    Com12,
    Com13,
    Com14,
    Com15,
    Com16,
    TgtB,
    TgtR,
    TgtGb,
    TgtGr,
    LcCtr,
    LcXc,
    LcYc,
    LcCoef,
    LcRadi,
    LcCoefB,
    LcCoefR,
    FixGain,
    Aref0,
    Aref1,
    Aref2,
    Aref3,
    Aref4,
    Aref5,
    Aref6,
    Aref7,
    // 0x56..0x5f reserved
    UFix = 0x60,
    VFix,
    AwbBBlk,
    AwbCtrl0,
    DspCtrl1,
    DspCtrl2,
    DspCtrl3,
    DspCtrl4,
    AwbBias,
    AwbCtrl1,
    AwbCtrl2,
    AwbCtrl3,
    AwbCtrl4,
    AwbCtrl5,
    AwbCtrl6,
    AwbCtrl7,
    AwbCtrl8,
    AwbCtrl9,
    AwbCtrl10,
    AwbCtrl11,
    AwbCtrl12,
    AwbCtrl13,
    AwbCtrl14,
    AwbCtrl15,
    AwbCtrl16,
    AwbCtrl17,
    AwbCtrl18,
    AwbRGainRange,
    AwbGGainRange,
    AwbBGainRange,
    Gamma1,
    Gamma2,
    Gamma3,
    Gamma4,
    Gamma5,
    Gamma6,
    Gamma7,
    Gamma8,
    Gamma9,
    Gamma10,
    Gamma11,
    Gamma12,
    Gamma13,
    Gamma14,
    Gamma15,
    GammaSlope,
    DenoiseThresh,
    Edge0,
    Edge1,
    DenoiseThreshCtrl,
    Edge2,
    Edge3,
    MatrixCoeff1,
    MatrixCoeff2,
    MatrixCoeff3,
    MatrixCoeff4,
    MatrixCoeff5,
    MatrixCoeff6,
    MatrixCtrl,
    Brightness,
    ContrastGain,
    Reserved9d,
    UvAdj0,
    UvAdj1,
    Scale0,
    Scale1,
    Scale2,
    FifoDelayCtrlManual,
    FifoDelayCtrlAuto,
    ReservedA5,
    Sde,
    USat,
    VSat,
    HueCos,
    HueSin,
    HueSign,
    DspAuto,
}

// COM3
pub const COM3_VFLIP_IMAGE: u8 = BIT_7;
pub const COM3_HFLIP_IMAGE: u8 = BIT_6;
pub const COM3_SWAP_BR: u8 = BIT_5;
pub const COM3_SWAP_YUV: u8 = BIT_4;
pub const COM3_SWAP_OUTPUT_MSB: u8 = BIT_3;
pub const COM3_POWER_DOWN_CLOCK_TRISTATE: u8 = BIT_2;
pub const COM3_POWER_DOWN_OUTPUT_TRISTATE: u8 = BIT_1;
pub const COM3_ENABLE_TEST_PATTERN: u8 = BIT_0;

// COM4
pub const COM4_PLL_BYPASS: u8 = 0 << 6;
pub const COM4_PLL_4X: u8 = 1 << 6;
pub const COM4_PLL_6X: u8 = 2 << 6;
pub const COM4_PLL_8X: u8 = 3 << 6;
pub const COM4_AEC_FULL_WINDOW: u8 = 0 << 4;
pub const COM4_AEC_HALF_WINDOW: u8 = 1 << 4;
pub const COM4_AEC_QUARTER_WINDOW: u8 = 2 << 4;
pub const COM4_AEC_LOW_TWOTHIRD_WINDOW: u8 = 3 << 4;

// COM7
pub const COM7_SCCB_RESET: u8 = BIT_7;
pub const COM7_RES_VGA: u8 = 0 << 6;
pub const COM7_RES_QVGA: u8 = 1 << 6;
pub const COM7_FMT_GBR422: u8 = 0 << 2;
pub const COM7_FMT_RGB565: u8 = 1 << 2;
pub const COM7_FMT_RGB555: u8 = 2 << 2;
pub const COM7_FMT_GBR444: u8 = 3 << 2;
pub const COM7_OFMT_YUV: u8 = 0;
pub const COM7_OFMT_PROCESSED_BAYER: u8 = 1;
pub const COM7_OFMT_RGB: u8 = 2;
pub const COM7_OFMT_BAYER_RAW: u8 = 3;

// COM8
pub const COM8_ENABLE_FAST_AGC_AEC: u8 = BIT_7;
pub const COM8_AEC_STEP_SIZE_VBLANK: u8 = 1 << 6;
pub const COM8_AEC_STEP_SIZE_UNLIMITED: u8 = 0 << 6;
pub const COM8_ENABLE_BANDING_FILTER: u8 = BIT_5;
pub const COM8_ENABLE_AEC_BELOW_BANDING: u8 = BIT_4;
pub const COM8_ENABLE_FINE_AEC: u8 = BIT_3;
pub const COM8_ENABLE_AGC: u8 = BIT_2;
pub const COM8_ENABLE_AWB: u8 = BIT_1;
pub const COM8_ENABLE_AEC: u8 = BIT_0;

// COM11
pub const COM11_ENABLE_SINGLE_FRAME_TRANSFER_TRIGGER: u8 = BIT_0;
pub const COM11_ENABLE_SINGLE_FRAME: u8 = BIT_1;

// COM13
pub const COM13_ENABLE_ABLC_GAIN_TRIGGER: u8 = BIT_2;
pub const COM13_ENABLE_ANALOG_BLC: u8 = BIT_5;
pub const COM13_ENABLE_ADC_BLC: u8 = BIT_6;
pub const COM13_ENABLE_BLC: u8 = BIT_7;

// DSP_CTRL1
pub const DSP_CTRL1_ENABLE_FIFO_SELECTION: u8 = BIT_7;
pub const DSP_CTRL1_ENABLE_UV_ADJUST: u8 = BIT_6;
pub const DSP_CTRL1_ENABLE_SDE: u8 = BIT_5;
pub const DSP_CTRL1_ENABLE_COLOR_MATRIX: u8 = BIT_4;
pub const DSP_CTRL1_ENABLE_INTERPOLATION: u8 = BIT_3;
pub const DSP_CTRL1_ENABLE_GAMMA_FUNCTION: u8 = BIT_2;
pub const DSP_CTRL1_AUTO_CORRECT_BLACK_DEFECT: u8 = BIT_1;
pub const DSP_CTRL1_AUTO_CORRECT_WHITE_DEFECT: u8 = BIT_0;

// DSP_CTRL2
pub const DSP_CTRL2_ENABLE_HORZ_ZOOM: u8 = BIT_0;
pub const DSP_CTRL2_ENABLE_VERT_ZOOM: u8 = BIT_1;
pub const DSP_CTRL2_ENABLE_HORZ_DCW: u8 = BIT_2;
pub const DSP_CTRL2_ENABLE_VERT_DCW: u8 = BIT_3;
pub const DSP_CTRL2_QVGA_ZOOM: u8 =
    DSP_CTRL2_ENABLE_HORZ_ZOOM | DSP_CTRL2_ENABLE_VERT_ZOOM | DSP_CTRL2_ENABLE_HORZ_DCW | DSP_CTRL2_ENABLE_VERT_DCW;

// DSP_CTRL4
pub const DSP_CTRL4_OUTPUT_YUV: u8 = 0;
pub const DSP_CTRL4_OUTPUT_RAW8: u8 = 2;
pub const DSP_CTRL4_OUTPUT_RAW10: u8 = 3;

// AWB_CTRL0
pub const AWB_CTRL0_ENABLE_AWB_GAIN: u8 = BIT_7;
pub const AWB_CTRL0_CALCULATE_AWB: u8 = BIT_6;

// HUE_SIGN
pub const HUE_SIGN_NEGATIVE_SIN: u8 = BIT_1;

const INIT_COM13: u8 =
    BIT_0 | BIT_1 | BIT_4 | COM13_ENABLE_ANALOG_BLC | COM13_ENABLE_ADC_BLC | COM13_ENABLE_BLC;
const INIT_COM8: u8 = COM8_ENABLE_AEC
    | COM8_ENABLE_AWB
    | COM8_ENABLE_AGC
    | COM8_ENABLE_FINE_AEC
    | COM8_ENABLE_AEC_BELOW_BANDING
    | COM8_AEC_STEP_SIZE_VBLANK
    | COM8_ENABLE_FAST_AGC_AEC;

pub const INITIALIZATION_DATA: &[RegisterSetting<SensorReg>] = &[
    setting(SensorReg::Com12, 0x00),
    setting(SensorReg::ClockControl, 0x00),
    setting(SensorReg::Com9, 0x40),
    setting(SensorReg::Com10, 0x00),

    setting(SensorReg::AwbCtrl0, 0xaa),
    setting(SensorReg::AwbCtrl1, 0x87),
    setting(SensorReg::DspCtrl3, 0x00),

    setting(SensorReg::Com11, BIT_4),
    setting(SensorReg::Aref0, 0x0f),
    setting(SensorReg::Com13, INIT_COM13),
    setting(SensorReg::Com4, BIT_0 | COM4_PLL_4X),
    setting(SensorReg::Href, 0x00),
    setting(SensorReg::BdBase, 0x7f),
    setting(SensorReg::BdMaxStep, 0x03),
    setting(SensorReg::Aew, 0x40),
    setting(SensorReg::Aeb, 0x30),
    setting(SensorReg::Vpt, 0xa1),
    setting(SensorReg::Exhch, 0x00),
    setting(SensorReg::Exhcl, 0x00),
    setting(SensorReg::Com8, INIT_COM8),
    setting(SensorReg::Com3, 0xc0),

    setting(SensorReg::DenoiseThresh, 0x00),
];

pub const START_VGA: &[RegisterSetting<SensorReg>] = &[
    setting(SensorReg::HorizontalStart, 0x26),
    setting(SensorReg::HorizontalSize, 0xa0),
    setting(SensorReg::VerticalStart, 0x07),
    setting(SensorReg::VerticalSize, 0xf0),
    setting(SensorReg::HOutSize, 0xa0),
    setting(SensorReg::VOutSize, 0xf0),
    setting(SensorReg::DspCtrl2, BIT_5),
];

pub const START_QVGA: &[RegisterSetting<SensorReg>] = &[
    setting(SensorReg::HorizontalStart, 0x3f),
    setting(SensorReg::HorizontalSize, 0x50),
    setting(SensorReg::VerticalStart, 0x03),
    setting(SensorReg::VerticalSize, 0x78),
    setting(SensorReg::HOutSize, 0x50),
    setting(SensorReg::VOutSize, 0x78),
    setting(SensorReg::DspCtrl2, BIT_5 | DSP_CTRL2_QVGA_ZOOM),
];

#[cfg(test)]
mod tests {
    use num_traits::FromPrimitive;

    use super::*;

    #[test]
    fn register_blocks_line_up() {
        assert_eq!(SensorReg::Pid as u8, 0x0a);
        assert_eq!(SensorReg::Com7 as u8, 0x12);
        assert_eq!(SensorReg::Aref7 as u8, 0x55);
        assert_eq!(SensorReg::DspCtrl4 as u8, 0x67);
        assert_eq!(SensorReg::DenoiseThresh as u8, 0x8e);
        assert_eq!(SensorReg::ContrastGain as u8, 0x9c);
        assert_eq!(SensorReg::DspAuto as u8, 0xac);
    }

    #[test]
    fn reserved_gap_has_no_register() {
        assert_eq!(SensorReg::from_u8(0x58), None);
        assert_eq!(SensorReg::from_u8(0x60), Some(SensorReg::UFix));
    }

    #[test]
    fn composite_init_values() {
        assert_eq!(INIT_COM13, 0xf3);
        assert_eq!(INIT_COM8, 0xdf);
        assert_eq!(START_QVGA[6].value, 0x2f);
    }
}
