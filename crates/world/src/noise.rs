//! Fractal Perlin fields sampled by the terrain generator.

use noise::{NoiseFn, Perlin};

/// Shape of one fractal field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldShape {
    /// Summed Perlin layers.
    pub octaves: u32,
    /// Frequency of the first layer, in cycles per cell.
    pub base_frequency: f64,
    /// Frequency growth per layer.
    pub lacunarity: f64,
    /// Amplitude decay per layer.
    pub gain: f64,
}

impl FieldShape {
    /// Landmass scale with fine detail on top.
    pub const ELEVATION: Self = Self {
        octaves: 5,
        base_frequency: 0.02,
        lacunarity: 2.1,
        gain: 0.5,
    };

    /// Broad bands spanning many chunks.
    pub const HEAT: Self = Self {
        octaves: 3,
        base_frequency: 0.008,
        lacunarity: 2.0,
        gain: 0.5,
    };

    /// Like heat but on a different period so the two never line up.
    pub const MOISTURE: Self = Self {
        octaves: 3,
        base_frequency: 0.011,
        lacunarity: 2.0,
        gain: 0.5,
    };
}

/// A seeded fractal field over world-space cell coordinates.
pub struct FractalField {
    perlin: Perlin,
    shape: FieldShape,
}

impl FractalField {
    /// Build a field; equal seeds and shapes sample identically.
    pub fn new(seed: u32, shape: FieldShape) -> Self {
        Self {
            perlin: Perlin::new(seed),
            shape,
        }
    }

    /// Normalised sample in [-1, 1].
    pub fn at(&self, x: f64, y: f64) -> f64 {
        let FieldShape {
            octaves,
            base_frequency,
            lacunarity,
            gain,
        } = self.shape;

        let (sum, weight, _, _) = (0..octaves).fold(
            (0.0, 0.0, 1.0, base_frequency),
            |(sum, weight, amp, freq), _| {
                let v = self.perlin.get([x * freq, y * freq]);
                (sum + v * amp, weight + amp, amp * gain, freq * lacunarity)
            },
        );

        if weight == 0.0 {
            return 0.0;
        }
        (sum / weight).clamp(-1.0, 1.0)
    }

    /// Sample quantised onto 0..=255.
    pub fn byte_at(&self, x: f64, y: f64) -> u8 {
        ((self.at(x, y) * 0.5 + 0.5) * 255.0).round() as u8
    }
}

/// The three fields a chunk is painted from.
pub struct ClimateNoise {
    elevation: FractalField,
    heat: FractalField,
    moisture: FractalField,
}

impl ClimateNoise {
    /// Derive all fields from one world seed.
    pub fn new(world_seed: u64) -> Self {
        let seed = (world_seed ^ (world_seed >> 32)) as u32;
        Self {
            elevation: FractalField::new(seed, FieldShape::ELEVATION),
            heat: FractalField::new(seed.wrapping_add(3000), FieldShape::HEAT),
            moisture: FractalField::new(seed.wrapping_add(4000), FieldShape::MOISTURE),
        }
    }

    /// Sample (elevation, heat, moisture) at a world-space cell.
    pub fn sample(&self, x: f64, y: f64) -> (f64, u8, u8) {
        (
            self.elevation.at(x, y),
            self.heat.byte_at(x, y),
            self.moisture.byte_at(x, y),
        )
    }
}
