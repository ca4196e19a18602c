//! Bi-temporal image sources and batching.
//!
//! A sample is a pair of co-registered RGB images plus a binary change
//! label. Sources yield samples by index; [`DataLoader`] groups them into
//! batches of candle tensors, optionally shuffled, repeated and cropped.

use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use image::GrayImage;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::{MlError, Result};

/// Channels per image.
pub const CHANNELS: usize = 3;

/// One image pair in CHW layout with values in `[0, 1]`, and its label map.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Identifier used as the output file name.
    pub name: String,
    pub height: usize,
    pub width: usize,
    pub t1: Vec<f32>,
    pub t2: Vec<f32>,
    /// `1` where the scene changed, `0` elsewhere.
    pub label: Vec<u8>,
}

impl Sample {
    /// Crop the central `size × size` window. Samples smaller than `size`
    /// along an axis keep that axis whole.
    pub fn center_crop(self, size: usize) -> Self {
        let h = size.min(self.height);
        let w = size.min(self.width);
        if h == self.height && w == self.width {
            return self;
        }
        let top = (self.height - h) / 2;
        let left = (self.width - w) / 2;
        let plane = self.height * self.width;

        let crop_plane = |src: &[f32]| -> Vec<f32> {
            let mut out = Vec::with_capacity(CHANNELS * h * w);
            for c in 0..CHANNELS {
                for y in top..top + h {
                    let row = c * plane + y * self.width;
                    out.extend_from_slice(&src[row + left..row + left + w]);
                }
            }
            out
        };
        let mut label = Vec::with_capacity(h * w);
        for y in top..top + h {
            let row = y * self.width;
            label.extend_from_slice(&self.label[row + left..row + left + w]);
        }

        Sample {
            t1: crop_plane(&self.t1),
            t2: crop_plane(&self.t2),
            label,
            height: h,
            width: w,
            name: self.name,
        }
    }
}

/// An indexable collection of samples.
pub trait DataSource: Send {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, index: usize) -> Result<Sample>;
}

/// PNG triplets under `<root>/{A,B,label}/<name>.png`.
///
/// Label pixels greater than zero mark change.
pub struct FolderDataset {
    root: PathBuf,
    names: Vec<String>,
}

impl FolderDataset {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let dir_a = root.join("A");
        let entries = std::fs::read_dir(&dir_a).map_err(|e| {
            MlError::dataset(format!("cannot list '{}': {e}", dir_a.display()))
        })?;

        let mut names = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let is_png = path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("png"));
            if !is_png {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                names.push(name.to_string());
            }
        }
        names.sort();

        for name in &names {
            for sub in ["B", "label"] {
                if !root.join(sub).join(name).is_file() {
                    return Err(MlError::dataset(format!(
                        "'{name}' has no counterpart in '{}'",
                        root.join(sub).display()
                    )));
                }
            }
        }
        if names.is_empty() {
            return Err(MlError::dataset(format!(
                "no PNG images found in '{}'",
                dir_a.display()
            )));
        }
        tracing::debug!(root = %root.display(), samples = names.len(), "folder dataset opened");
        Ok(Self { root, names })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn read_rgb(path: &Path) -> Result<(Vec<f32>, usize, usize)> {
    let img = image::open(path)?.to_rgb8();
    let (w, h) = (img.width() as usize, img.height() as usize);
    let mut chw = vec![0f32; CHANNELS * h * w];
    for (x, y, pixel) in img.enumerate_pixels() {
        let offset = y as usize * w + x as usize;
        for c in 0..CHANNELS {
            chw[c * h * w + offset] = f32::from(pixel.0[c]) / 255.0;
        }
    }
    Ok((chw, h, w))
}

impl DataSource for FolderDataset {
    fn len(&self) -> usize {
        self.names.len()
    }

    fn get(&self, index: usize) -> Result<Sample> {
        let name = self
            .names
            .get(index)
            .ok_or_else(|| MlError::dataset(format!("index {index} out of range")))?;
        let (t1, h, w) = read_rgb(&self.root.join("A").join(name))?;
        let (t2, h2, w2) = read_rgb(&self.root.join("B").join(name))?;
        let label_img = image::open(self.root.join("label").join(name))?.to_luma8();
        if (h2, w2) != (h, w) || label_img.dimensions() != (w as u32, h as u32) {
            return Err(MlError::dataset(format!("'{name}': image sizes differ")));
        }
        let label = label_img.pixels().map(|p| u8::from(p.0[0] > 0)).collect();
        Ok(Sample {
            name: name.clone(),
            height: h,
            width: w,
            t1,
            t2,
            label,
        })
    }
}

/// Deterministic random image pairs with one rectangular changed region each.
pub struct SyntheticDataset {
    len: usize,
    size: usize,
    seed: u64,
}

impl SyntheticDataset {
    pub fn new(len: usize, size: usize, seed: u64) -> Self {
        Self {
            len,
            size: size.max(4),
            seed,
        }
    }
}

impl DataSource for SyntheticDataset {
    fn len(&self) -> usize {
        self.len
    }

    fn get(&self, index: usize) -> Result<Sample> {
        if index >= self.len {
            return Err(MlError::dataset(format!("index {index} out of range")));
        }
        let n = self.size;
        let plane = n * n;
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ index as u64);

        // Smooth background: a base colour per channel plus mild noise.
        let mut t1 = Vec::with_capacity(CHANNELS * plane);
        for _ in 0..CHANNELS {
            let base: f32 = rng.gen_range(0.2..0.8);
            t1.extend((0..plane).map(|_| (base + rng.gen_range(-0.05..0.05)).clamp(0.0, 1.0)));
        }
        let mut t2: Vec<f32> = t1
            .iter()
            .map(|v| (v + rng.gen_range(-0.02..0.02)).clamp(0.0, 1.0))
            .collect();

        let rect_h = rng.gen_range(n / 4..=n / 2);
        let rect_w = rng.gen_range(n / 4..=n / 2);
        let top = rng.gen_range(0..=n - rect_h);
        let left = rng.gen_range(0..=n - rect_w);
        let mut label = vec![0u8; plane];
        for y in top..top + rect_h {
            for x in left..left + rect_w {
                let offset = y * n + x;
                label[offset] = 1;
                for c in 0..CHANNELS {
                    let i = c * plane + offset;
                    t2[i] = 1.0 - t1[i];
                }
            }
        }

        Ok(Sample {
            name: format!("{index:05}.png"),
            height: n,
            width: n,
            t1,
            t2,
            label,
        })
    }
}

/// A stacked group of samples on the target device.
pub struct Batch {
    pub names: Vec<String>,
    /// `(B, 3, H, W)`
    pub t1: Tensor,
    /// `(B, 3, H, W)`
    pub t2: Tensor,
    /// Class indices `(B, H, W)`.
    pub label: Tensor,
    /// Per-sample label maps for metric updates.
    pub label_maps: Vec<Vec<u8>>,
    pub height: usize,
    pub width: usize,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Batches a [`DataSource`] epoch by epoch.
pub struct DataLoader {
    source: Box<dyn DataSource>,
    batch_size: usize,
    repeats: usize,
    crop_size: usize,
    rng: Option<StdRng>,
    device: Device,
}

impl DataLoader {
    pub fn new(source: Box<dyn DataSource>, batch_size: usize, device: &Device) -> Self {
        Self {
            source,
            batch_size: batch_size.max(1),
            repeats: 1,
            crop_size: 0,
            rng: None,
            device: device.clone(),
        }
    }

    /// Visit samples in a fresh random order every epoch.
    pub fn shuffled(mut self, seed: u64) -> Self {
        self.rng = Some(StdRng::seed_from_u64(seed));
        self
    }

    /// Visit every sample `repeats` times per epoch.
    pub fn with_repeats(mut self, repeats: usize) -> Self {
        self.repeats = repeats.max(1);
        self
    }

    /// Center-crop samples to `size`; `0` disables cropping.
    pub fn with_crop(mut self, size: usize) -> Self {
        self.crop_size = size;
        self
    }

    pub fn num_samples(&self) -> usize {
        self.source.len() * self.repeats
    }

    pub fn num_batches(&self) -> usize {
        self.num_samples().div_ceil(self.batch_size)
    }

    /// Sample indices for one epoch, grouped into batches.
    pub fn epoch_batches(&mut self) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..self.repeats)
            .flat_map(|_| 0..self.source.len())
            .collect();
        if let Some(rng) = &mut self.rng {
            order.shuffle(rng);
        }
        order.chunks(self.batch_size).map(<[usize]>::to_vec).collect()
    }

    /// Load and stack the samples at `indices`.
    pub fn load(&self, indices: &[usize]) -> Result<Batch> {
        let mut samples = Vec::with_capacity(indices.len());
        for &index in indices {
            let sample = self.source.get(index)?;
            samples.push(if self.crop_size > 0 {
                sample.center_crop(self.crop_size)
            } else {
                sample
            });
        }
        let Some(first) = samples.first() else {
            return Err(MlError::dataset("empty batch"));
        };
        let (h, w) = (first.height, first.width);
        if samples.iter().any(|s| (s.height, s.width) != (h, w)) {
            return Err(MlError::dataset(
                "samples in a batch must share one size; set crop_size to batch mixed sizes",
            ));
        }

        let b = samples.len();
        let mut t1 = Vec::with_capacity(b * CHANNELS * h * w);
        let mut t2 = Vec::with_capacity(b * CHANNELS * h * w);
        let mut label = Vec::with_capacity(b * h * w);
        let mut names = Vec::with_capacity(b);
        let mut label_maps = Vec::with_capacity(b);
        for s in samples {
            t1.extend_from_slice(&s.t1);
            t2.extend_from_slice(&s.t2);
            label.extend(s.label.iter().map(|&v| u32::from(v)));
            names.push(s.name);
            label_maps.push(s.label);
        }

        Ok(Batch {
            names,
            t1: Tensor::from_vec(t1, (b, CHANNELS, h, w), &self.device)?,
            t2: Tensor::from_vec(t2, (b, CHANNELS, h, w), &self.device)?,
            label: Tensor::from_vec(label, (b, h, w), &self.device)?,
            label_maps,
            height: h,
            width: w,
        })
    }
}

/// Write a binary change map as an 8-bit grayscale PNG (change = 255).
pub fn write_change_map(path: &Path, map: &[u8], height: usize, width: usize) -> Result<()> {
    let pixels = map.iter().map(|&v| v.saturating_mul(255)).collect();
    let img = GrayImage::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| MlError::dataset(format!("change map does not fit {width}x{height}")))?;
    img.save(path)?;
    Ok(())
}
