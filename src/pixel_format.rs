//! Pixel layouts and the fixed set of conversions between them.
//!
//! The sensor delivers an 8 bit GRBG Bayer mosaic. Conversions out of it
//! demosaic bilinearly, reflecting about the border pixel at the image edges
//! (index -1 reads index 1), which keeps the mosaic colour phase.

use crate::error::{Error, Result};

/// NOTE: not every format is produced by the hardware, and not every pair
/// converts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// GRBG mosaic, one byte per pixel
    Bayer8,
    /// GRBG mosaic, 10 bits per pixel packed
    Bayer10,
    Bayer16,
    Bgr24,
    Rgb24,
    Bgra32,
    Rgba32,
    Gray,
    Yuyv,
    Uyvy,
}

impl PixelFormat {
    pub const ALL: [PixelFormat; 10] = [
        PixelFormat::Bayer8,
        PixelFormat::Bayer10,
        PixelFormat::Bayer16,
        PixelFormat::Bgr24,
        PixelFormat::Rgb24,
        PixelFormat::Bgra32,
        PixelFormat::Rgba32,
        PixelFormat::Gray,
        PixelFormat::Yuyv,
        PixelFormat::Uyvy,
    ];

    pub fn size_bytes(&self, width: usize, height: usize) -> usize {
        match self {
            PixelFormat::Bayer8 => width * height,
            PixelFormat::Bayer10 => 5 * width * height / 4,
            PixelFormat::Bayer16 => width * height * 2,
            PixelFormat::Bgr24 | PixelFormat::Rgb24 => width * height * 3,
            PixelFormat::Bgra32 | PixelFormat::Rgba32 => width * height * 4,
            PixelFormat::Gray => width * height,
            PixelFormat::Yuyv | PixelFormat::Uyvy => width * height * 2,
        }
    }

    pub fn is_rgb_family(&self) -> bool {
        matches!(self, PixelFormat::Bgr24 | PixelFormat::Rgb24 | PixelFormat::Bgra32 | PixelFormat::Rgba32)
    }
}

type ConvertFn = fn(&[u8], &mut [u8], usize, usize, bool);

#[derive(Debug, Clone, Copy)]
struct Layout {
    bpp: usize,
    b: usize,
    g: usize,
    r: usize,
    alpha: Option<usize>,
}

const BGR: usize = 0;
const RGB: usize = 1;
const BGRA: usize = 2;
const RGBA: usize = 3;

const LAYOUTS: [Layout; 4] = [
    Layout { bpp: 3, b: 0, g: 1, r: 2, alpha: None },
    Layout { bpp: 3, b: 2, g: 1, r: 0, alpha: None },
    Layout { bpp: 4, b: 0, g: 1, r: 2, alpha: Some(3) },
    Layout { bpp: 4, b: 2, g: 1, r: 0, alpha: Some(3) },
];

static CONVERSIONS: &[((PixelFormat, PixelFormat), ConvertFn)] = {
    use self::PixelFormat::*;
    &[
        ((Bayer8, Bgr24), demosaic_rgb::<BGR> as ConvertFn),
        ((Bayer8, Rgb24), demosaic_rgb::<RGB>),
        ((Bayer8, Bgra32), demosaic_rgb::<BGRA>),
        ((Bayer8, Rgba32), demosaic_rgb::<RGBA>),
        ((Bayer8, Gray), demosaic_gray),
        ((Bayer8, Yuyv), demosaic_yuv422::<false>),
        ((Bayer8, Uyvy), demosaic_yuv422::<true>),
        ((Bgr24, Rgb24), remap_rgb::<BGR, RGB>),
        ((Bgr24, Bgra32), remap_rgb::<BGR, BGRA>),
        ((Bgr24, Rgba32), remap_rgb::<BGR, RGBA>),
        ((Rgb24, Bgr24), remap_rgb::<RGB, BGR>),
        ((Rgb24, Bgra32), remap_rgb::<RGB, BGRA>),
        ((Rgb24, Rgba32), remap_rgb::<RGB, RGBA>),
        ((Bgra32, Bgr24), remap_rgb::<BGRA, BGR>),
        ((Bgra32, Rgb24), remap_rgb::<BGRA, RGB>),
        ((Bgra32, Rgba32), remap_rgb::<BGRA, RGBA>),
        ((Rgba32, Bgr24), remap_rgb::<RGBA, BGR>),
        ((Rgba32, Rgb24), remap_rgb::<RGBA, RGB>),
        ((Rgba32, Bgra32), remap_rgb::<RGBA, BGRA>),
        ((Bgr24, Gray), rgb_to_gray::<BGR>),
        ((Rgb24, Gray), rgb_to_gray::<RGB>),
        ((Bgra32, Gray), rgb_to_gray::<BGRA>),
        ((Rgba32, Gray), rgb_to_gray::<RGBA>),
        ((Yuyv, Uyvy), swap_yuv_pairs),
        ((Uyvy, Yuyv), swap_yuv_pairs),
    ]
};

fn lookup(from: PixelFormat, to: PixelFormat) -> Option<ConvertFn> {
    CONVERSIONS
        .iter()
        .find(|((f, t), _)| *f == from && *t == to)
        .map(|(_, func)| *func)
}

/// True if `convert(from, to, ..)` has a routine for the pair.
pub fn is_supported(from: PixelFormat, to: PixelFormat) -> bool {
    from == to || lookup(from, to).is_some()
}

/// Converts one frame. With `flip_v` the output rows are written bottom-up.
pub fn convert(
    from: PixelFormat,
    to: PixelFormat,
    input: &[u8],
    output: &mut [u8],
    width: u32,
    height: u32,
    flip_v: bool,
) -> Result<()> {
    let func = if from == to { None } else {
        match lookup(from, to) {
            Some(func) => Some(func),
            None => return Err(Error::UnimplementedConversion { from, to }),
        }
    };

    let (w, h) = (width as usize, height as usize);
    let invalid = Error::InvalidGeometry { width, height };
    if w == 0 || h == 0 {
        return Err(invalid);
    }
    if from == PixelFormat::Bayer8 && from != to && (w % 2 != 0 || h % 2 != 0) {
        return Err(invalid);
    }
    if (matches!(from, PixelFormat::Yuyv | PixelFormat::Uyvy) || matches!(to, PixelFormat::Yuyv | PixelFormat::Uyvy))
        && w % 2 != 0
    {
        return Err(invalid);
    }

    let needed = from.size_bytes(w, h);
    if input.len() < needed {
        return Err(Error::BufferTooSmall { needed, actual: input.len() });
    }
    let needed = to.size_bytes(w, h);
    if output.len() < needed {
        return Err(Error::BufferTooSmall { needed, actual: output.len() });
    }

    match func {
        Some(func) => func(input, output, w, h, flip_v),
        None => copy_frame(from, input, output, w, h, flip_v)?,
    }
    Ok(())
}

fn copy_frame(format: PixelFormat, input: &[u8], output: &mut [u8], width: usize, height: usize, flip_v: bool) -> Result<()> {
    let size = format.size_bytes(width, height);
    if !flip_v {
        output[..size].copy_from_slice(&input[..size]);
        return Ok(());
    }
    let stride = format.size_bytes(width, 1);
    if stride * height != size {
        return Err(Error::InvalidGeometry { width: width as u32, height: height as u32 });
    }
    for (y, row) in input[..size].chunks_exact(stride).enumerate() {
        let dst = (height - 1 - y) * stride;
        output[dst..dst + stride].copy_from_slice(row);
    }
    Ok(())
}

#[inline]
fn out_row(y: usize, height: usize, flip_v: bool) -> usize {
    if flip_v { height - 1 - y } else { y }
}

#[inline]
fn reflect(i: isize, n: usize) -> usize {
    if i < 0 {
        (-i) as usize
    } else if i as usize >= n {
        2 * (n - 1) - i as usize
    } else {
        i as usize
    }
}

/// Bilinear GRBG reconstruction of one pixel, as (b, g, r).
#[inline]
fn grbg_pixel(input: &[u8], width: usize, height: usize, y: usize, x: usize) -> [u8; 3] {
    let at = |dy: isize, dx: isize| -> u32 {
        let yy = reflect(y as isize + dy, height);
        let xx = reflect(x as isize + dx, width);
        input[yy * width + xx] as u32
    };
    let here = at(0, 0);
    let horz = (at(0, -1) + at(0, 1) + 1) / 2;
    let vert = (at(-1, 0) + at(1, 0) + 1) / 2;
    let cross = (at(-1, 0) + at(1, 0) + at(0, -1) + at(0, 1) + 2) / 4;
    let diag = (at(-1, -1) + at(-1, 1) + at(1, -1) + at(1, 1) + 2) / 4;

    let (b, g, r) = match (y % 2, x % 2) {
        // green on a red row
        (0, 0) => (vert, here, horz),
        // red
        (0, _) => (diag, cross, here),
        // blue
        (_, 0) => (here, cross, diag),
        // green on a blue row
        (_, _) => (horz, here, vert),
    };
    [b as u8, g as u8, r as u8]
}

#[inline]
fn bgr_to_gray(b: u8, g: u8, r: u8) -> u8 {
    // BT.601 luma in 14 bit fixed point
    ((1868 * b as u32 + 9617 * g as u32 + 4899 * r as u32 + 8192) >> 14) as u8
}

#[inline]
fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

#[inline]
fn bgr_to_y(b: i32, g: i32, r: i32) -> u8 {
    clamp_u8(((66 * r + 129 * g + 25 * b + 128) >> 8) + 16)
}

#[inline]
fn bgr_to_u(b: i32, g: i32, r: i32) -> u8 {
    clamp_u8(((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128)
}

#[inline]
fn bgr_to_v(b: i32, g: i32, r: i32) -> u8 {
    clamp_u8(((112 * r - 94 * g - 18 * b + 128) >> 8) + 128)
}

#[inline]
fn store(layout: &Layout, px: &mut [u8], bgr: [u8; 3]) {
    px[layout.b] = bgr[0];
    px[layout.g] = bgr[1];
    px[layout.r] = bgr[2];
    if let Some(a) = layout.alpha {
        px[a] = 255;
    }
}

fn demosaic_rgb<const OUT: usize>(input: &[u8], output: &mut [u8], width: usize, height: usize, flip_v: bool) {
    let layout = &LAYOUTS[OUT];
    let stride = width * layout.bpp;
    for y in 0..height {
        let row = out_row(y, height, flip_v) * stride;
        for x in 0..width {
            let px = &mut output[row + x * layout.bpp..row + (x + 1) * layout.bpp];
            store(layout, px, grbg_pixel(input, width, height, y, x));
        }
    }
}

fn demosaic_gray(input: &[u8], output: &mut [u8], width: usize, height: usize, flip_v: bool) {
    for y in 0..height {
        let row = out_row(y, height, flip_v) * width;
        for x in 0..width {
            let [b, g, r] = grbg_pixel(input, width, height, y, x);
            output[row + x] = bgr_to_gray(b, g, r);
        }
    }
}

/// Each 2x2 block shares one chroma pair computed from its mean colour.
fn demosaic_yuv422<const UYVY: bool>(input: &[u8], output: &mut [u8], width: usize, height: usize, flip_v: bool) {
    let stride = width * 2;
    for y in (0..height).step_by(2) {
        for x in (0..width).step_by(2) {
            let block = [
                grbg_pixel(input, width, height, y, x),
                grbg_pixel(input, width, height, y, x + 1),
                grbg_pixel(input, width, height, y + 1, x),
                grbg_pixel(input, width, height, y + 1, x + 1),
            ];
            let sum = |c: usize| block.iter().map(|p| p[c] as i32).sum::<i32>();
            let (b, g, r) = ((sum(0) + 2) / 4, (sum(1) + 2) / 4, (sum(2) + 2) / 4);
            let (u, v) = (bgr_to_u(b, g, r), bgr_to_v(b, g, r));

            for dy in 0..2 {
                let row = out_row(y + dy, height, flip_v) * stride;
                let p0 = block[dy * 2];
                let p1 = block[dy * 2 + 1];
                let y0 = bgr_to_y(p0[0] as i32, p0[1] as i32, p0[2] as i32);
                let y1 = bgr_to_y(p1[0] as i32, p1[1] as i32, p1[2] as i32);
                let dst = &mut output[row + x * 2..row + x * 2 + 4];
                if UYVY {
                    dst.copy_from_slice(&[u, y0, v, y1]);
                } else {
                    dst.copy_from_slice(&[y0, u, y1, v]);
                }
            }
        }
    }
}

fn remap_rgb<const FROM: usize, const TO: usize>(input: &[u8], output: &mut [u8], width: usize, height: usize, flip_v: bool) {
    let (src, dst) = (&LAYOUTS[FROM], &LAYOUTS[TO]);
    for y in 0..height {
        let in_row = y * width * src.bpp;
        let out_row = out_row(y, height, flip_v) * width * dst.bpp;
        for x in 0..width {
            let s = &input[in_row + x * src.bpp..in_row + (x + 1) * src.bpp];
            let bgr = [s[src.b], s[src.g], s[src.r]];
            let d = &mut output[out_row + x * dst.bpp..out_row + (x + 1) * dst.bpp];
            store(dst, d, bgr);
        }
    }
}

fn rgb_to_gray<const FROM: usize>(input: &[u8], output: &mut [u8], width: usize, height: usize, flip_v: bool) {
    let src = &LAYOUTS[FROM];
    for y in 0..height {
        let in_row = y * width * src.bpp;
        let row = out_row(y, height, flip_v) * width;
        for x in 0..width {
            let s = &input[in_row + x * src.bpp..];
            output[row + x] = bgr_to_gray(s[src.b], s[src.g], s[src.r]);
        }
    }
}

fn swap_yuv_pairs(input: &[u8], output: &mut [u8], width: usize, height: usize, flip_v: bool) {
    let stride = width * 2;
    for y in 0..height {
        let src = &input[y * stride..(y + 1) * stride];
        let row = out_row(y, height, flip_v) * stride;
        let dst = &mut output[row..row + stride];
        for (d, s) in dst.chunks_exact_mut(2).zip(src.chunks_exact(2)) {
            d[0] = s[1];
            d[1] = s[0];
        }
    }
}
