use crate::core::error::{EngineError, Result};
use crate::core::model::ModelConfigInfo;
use std::path::Path;

/// Decoded RGB image, row-major with interleaved channels, values in `[-1, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    width: usize,
    height: usize,
    data: Vec<f32>,
}

impl Image {
    pub fn new(width: usize, height: usize, data: Vec<f32>) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(EngineError::Image(format!("empty {width}x{height} image")));
        }
        let needed = rgb_len(width, height)?;
        if data.len() != needed {
            return Err(EngineError::Image(format!(
                "{width}x{height} RGB image needs {needed} values, got {}",
                data.len()
            )));
        }
        Ok(Self { width, height, data })
    }

    /// Maps 8-bit channels from `[0, 255]` to `[-1, 1]`.
    pub fn from_rgb8(width: usize, height: usize, rgb: &[u8]) -> Result<Self> {
        let data = rgb.iter().map(|&v| v as f32 / 255.0 * 2.0 - 1.0).collect();
        Self::new(width, height, data)
    }

    pub fn read_ppm(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| EngineError::io(path, "read image", e))?;
        Self::parse_ppm(&bytes).map_err(|e| match e {
            EngineError::Image(msg) => EngineError::Image(format!("{}: {msg}", path.display())),
            other => other,
        })
    }

    /// Parses a binary (P6) PPM with an 8-bit maximum value.
    pub fn parse_ppm(bytes: &[u8]) -> Result<Self> {
        let mut pos = 0;
        let magic = next_header_field(bytes, &mut pos)?;
        if magic != "P6" {
            return Err(EngineError::Image(format!("expected P6 image, found {magic:?}")));
        }
        let width = parse_dim(&next_header_field(bytes, &mut pos)?)?;
        let height = parse_dim(&next_header_field(bytes, &mut pos)?)?;
        let max_value = parse_dim(&next_header_field(bytes, &mut pos)?)?;
        if max_value == 0 || max_value > 255 {
            return Err(EngineError::Image(format!("unsupported max value {max_value}")));
        }
        // Exactly one whitespace byte separates the header from the raster.
        pos += 1;

        let len = rgb_len(width, height)?;
        let raster = pos
            .checked_add(len)
            .and_then(|end| bytes.get(pos..end))
            .ok_or_else(|| EngineError::Image(format!("truncated raster: expected {len} bytes")))?;
        let scale = 2.0 / max_value as f32;
        let data = raster.iter().map(|&v| v as f32 * scale - 1.0).collect();
        Self::new(width, height, data)
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn pixels(&self) -> &[f32] {
        &self.data
    }

    pub fn pixel(&self, x: usize, y: usize) -> [f32; 3] {
        let i = (y * self.width + x) * 3;
        [self.data[i], self.data[i + 1], self.data[i + 2]]
    }

    /// Bilinear resampling with pixel centers aligned.
    pub fn resize(&self, width: usize, height: usize) -> Image {
        if width == self.width && height == self.height {
            return self.clone();
        }
        let sx = self.width as f32 / width as f32;
        let sy = self.height as f32 / height as f32;
        let mut data = Vec::with_capacity(width * height * 3);
        for y in 0..height {
            let fy = ((y as f32 + 0.5) * sy - 0.5).clamp(0.0, (self.height - 1) as f32);
            let y0 = fy.floor() as usize;
            let y1 = (y0 + 1).min(self.height - 1);
            let wy = fy - y0 as f32;
            for x in 0..width {
                let fx = ((x as f32 + 0.5) * sx - 0.5).clamp(0.0, (self.width - 1) as f32);
                let x0 = fx.floor() as usize;
                let x1 = (x0 + 1).min(self.width - 1);
                let wx = fx - x0 as f32;
                let (p00, p01) = (self.pixel(x0, y0), self.pixel(x1, y0));
                let (p10, p11) = (self.pixel(x0, y1), self.pixel(x1, y1));
                for c in 0..3 {
                    let top = p00[c] + (p01[c] - p00[c]) * wx;
                    let bottom = p10[c] + (p11[c] - p10[c]) * wx;
                    data.push(top + (bottom - top) * wy);
                }
            }
        }
        Image {
            width,
            height,
            data,
        }
    }
}

fn next_header_field(bytes: &[u8], pos: &mut usize) -> Result<String> {
    loop {
        match bytes.get(*pos) {
            Some(b'#') => {
                while bytes.get(*pos).is_some_and(|&b| b != b'\n') {
                    *pos += 1;
                }
            }
            Some(b) if b.is_ascii_whitespace() => *pos += 1,
            Some(_) => break,
            None => return Err(EngineError::Image("truncated header".to_string())),
        }
    }
    let start = *pos;
    while bytes.get(*pos).is_some_and(|b| !b.is_ascii_whitespace()) {
        *pos += 1;
    }
    Ok(String::from_utf8_lossy(&bytes[start..*pos]).into_owned())
}

fn rgb_len(width: usize, height: usize) -> Result<usize> {
    width
        .checked_mul(height)
        .and_then(|n| n.checked_mul(3))
        .ok_or_else(|| EngineError::Image(format!("{width}x{height} image is too large")))
}

fn parse_dim(field: &str) -> Result<usize> {
    field
        .parse()
        .map_err(|_| EngineError::Image(format!("invalid header field {field:?}")))
}

/// Vision-tower output: `rows x cols` row-major `f32`, one row per image
/// patch, already projected into the language model's embedding space.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTokens {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl ImageTokens {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    /// Sized `vit_seq_len x model_dim` for `config`.
    pub fn for_config(config: &ModelConfigInfo) -> Self {
        Self::new(config.vit_seq_len, config.model_dim)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn row(&self, row: usize) -> &[f32] {
        &self.data[row * self.cols..(row + 1) * self.cols]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Raw little-endian `f32` bytes, as written by `image-tokens`.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.data)
    }
}
