//! Frame capture: ray output pixels read back to the CPU

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::backend::TextureFormat;
use crate::error::{RendererError, RendererResult};

/// File written by the capture demo
pub const DEFAULT_CAPTURE_PATH: &str = "output.ppm";

/// A tightly packed RGBA8 image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameCapture {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl FrameCapture {
    /// Strip row padding from readback data and convert it to RGBA
    pub fn from_padded_rows(
        width: u32,
        height: u32,
        row_pitch: u32,
        format: TextureFormat,
        data: &[u8],
    ) -> RendererResult<Self> {
        let row_bytes = (width * format.bytes_per_pixel()) as usize;
        let pitch = row_pitch as usize;
        if pitch < row_bytes {
            return Err(RendererError::Capture(format!(
                "row pitch {} below row size {}",
                row_pitch, row_bytes
            )));
        }
        let needed = pitch * (height as usize).saturating_sub(1) + row_bytes;
        if data.len() < needed {
            return Err(RendererError::Capture(format!(
                "readback holds {} bytes, {} needed",
                data.len(),
                needed
            )));
        }

        let mut pixels = Vec::with_capacity(row_bytes * height as usize);
        for row in 0..height as usize {
            pixels.extend_from_slice(&data[row * pitch..row * pitch + row_bytes]);
        }
        if format == TextureFormat::Bgra8Unorm {
            for texel in pixels.chunks_exact_mut(4) {
                texel.swap(0, 2);
            }
        }
        Ok(Self { width, height, pixels })
    }

    /// RGBA of the pixel at `(x, y)`
    pub fn pixel(&self, x: u32, y: u32) -> RendererResult<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return Err(RendererError::Capture(format!(
                "pixel ({}, {}) outside {}x{} capture",
                x, y, self.width, self.height
            )));
        }
        let at = (y as usize * self.width as usize + x as usize) * 4;
        self.pixels
            .get(at..at + 4)
            .and_then(|texel| texel.try_into().ok())
            .ok_or_else(|| RendererError::Capture(format!("no pixel data at ({}, {})", x, y)))
    }

    /// Number of pixels whose RGB differs from `color`
    pub fn count_pixels_not(&self, color: [u8; 4]) -> usize {
        self.pixels
            .chunks_exact(4)
            .filter(|p| p[..3] != color[..3])
            .count()
    }

    pub fn to_image(&self) -> RendererResult<image::RgbaImage> {
        image::RgbaImage::from_raw(self.width, self.height, self.pixels.clone())
            .ok_or_else(|| RendererError::Capture("pixel buffer does not match extent".to_string()))
    }

    /// Write as ASCII PPM (`P3`), one image row per line
    pub fn write_ppm<W: Write>(&self, out: &mut W) -> RendererResult<()> {
        writeln!(out, "P3\n{} {}\n255", self.width, self.height)?;
        for row in self.pixels.chunks_exact((self.width * 4) as usize) {
            let line = row
                .chunks_exact(4)
                .map(|p| format!("{} {} {}", p[0], p[1], p[2]))
                .collect::<Vec<_>>()
                .join(" ");
            writeln!(out, "{}", line)?;
        }
        Ok(())
    }

    /// Save to `path`. `.ppm` is written directly, other extensions go
    /// through the `image` crate.
    pub fn save(&self, path: impl AsRef<Path>) -> RendererResult<()> {
        let path = path.as_ref();
        let is_ppm = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("ppm"));
        if is_ppm {
            let mut out = BufWriter::new(File::create(path)?);
            self.write_ppm(&mut out)?;
            out.flush()?;
        } else {
            self.to_image()?
                .save(path)
                .map_err(|e| RendererError::Capture(format!("{}: {}", path.display(), e)))?;
        }
        log::info!("Saved {}x{} capture to {}", self.width, self.height, path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padding_is_stripped() {
        // 2x2 image with 4 bytes of padding per row
        let data = [
            1, 2, 3, 255, 4, 5, 6, 255, 0, 0, 0, 0, //
            7, 8, 9, 255, 10, 11, 12, 255, 0, 0, 0, 0,
        ];
        let capture = FrameCapture::from_padded_rows(2, 2, 12, TextureFormat::Rgba8Unorm, &data).unwrap();
        assert_eq!(capture.pixels.len(), 16);
        assert_eq!(capture.pixel(1, 1).unwrap(), [10, 11, 12, 255]);
    }

    #[test]
    fn test_bgra_is_swizzled() {
        let capture = FrameCapture::from_padded_rows(1, 1, 4, TextureFormat::Bgra8Unorm, &[3, 2, 1, 255]).unwrap();
        assert_eq!(capture.pixel(0, 0).unwrap(), [1, 2, 3, 255]);
    }

    #[test]
    fn test_short_readback_rejected() {
        // Two rows at a 256 byte pitch need 256 + 8 bytes
        let result = FrameCapture::from_padded_rows(2, 2, 256, TextureFormat::Rgba8Unorm, &[0; 263]);
        assert!(matches!(result, Err(RendererError::Capture(_))));
        assert!(FrameCapture::from_padded_rows(2, 2, 256, TextureFormat::Rgba8Unorm, &[0; 264]).is_ok());
    }

    #[test]
    fn test_pixel_out_of_range_rejected() {
        let capture = FrameCapture {
            width: 2,
            height: 1,
            pixels: vec![0; 8],
        };
        assert!(matches!(capture.pixel(2, 0), Err(RendererError::Capture(_))));
        assert!(matches!(capture.pixel(0, 1), Err(RendererError::Capture(_))));

        let empty = FrameCapture {
            width: 0,
            height: 0,
            pixels: Vec::new(),
        };
        assert!(empty.pixel(0, 0).is_err());
    }

    #[test]
    fn test_ppm_output() {
        let capture = FrameCapture {
            width: 2,
            height: 1,
            pixels: vec![255, 0, 0, 255, 0, 128, 255, 255],
        };
        let mut out = Vec::new();
        capture.write_ppm(&mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "P3\n2 1\n255\n255 0 0 0 128 255\n");
    }

    #[test]
    fn test_count_pixels_not_ignores_alpha() {
        let capture = FrameCapture {
            width: 2,
            height: 1,
            pixels: vec![10, 20, 30, 0, 10, 20, 31, 255],
        };
        assert_eq!(capture.count_pixels_not([10, 20, 30, 255]), 1);
    }
}
