//! Particle-indexed storage.
//!
//! Particles and batch elements are two axes of one array: particle `p` of batch element `b`
//! lives at `(p, b)`. Particles are exchangeable and identified only by position. Resampling
//! never mutates an array in place; [`Resample::resample`] builds a new value by looking up
//! ancestor positions in the old one.

use std::collections::BTreeMap;
use std::ops::Index;

use crate::error::{RbpfError, Result};

/// Dense `(n_particle, n_batch)` array, stored particle-major.
#[derive(Clone, Debug, PartialEq)]
pub struct ParticleArray<T> {
    n_particle: usize,
    n_batch: usize,
    data: Vec<T>,
}

/// Ancestor index for every `(particle, batch)` slot.
pub type AncestorIndices = ParticleArray<usize>;

impl<T> ParticleArray<T> {
    pub fn from_fn(
        n_particle: usize,
        n_batch: usize,
        mut f: impl FnMut(usize, usize) -> T,
    ) -> Self {
        let mut data = Vec::with_capacity(n_particle * n_batch);
        for p in 0..n_particle {
            for b in 0..n_batch {
                data.push(f(p, b));
            }
        }
        Self {
            n_particle,
            n_batch,
            data,
        }
    }

    /// Fallible variant of [`ParticleArray::from_fn`]; stops at the first error.
    pub fn try_from_fn<E>(
        n_particle: usize,
        n_batch: usize,
        mut f: impl FnMut(usize, usize) -> std::result::Result<T, E>,
    ) -> std::result::Result<Self, E> {
        let mut data = Vec::with_capacity(n_particle * n_batch);
        for p in 0..n_particle {
            for b in 0..n_batch {
                data.push(f(p, b)?);
            }
        }
        Ok(Self {
            n_particle,
            n_batch,
            data,
        })
    }

    /// Wrap particle-major data.
    pub fn from_vec(n_particle: usize, n_batch: usize, data: Vec<T>) -> Result<Self> {
        if data.len() != n_particle * n_batch {
            return Err(RbpfError::config(format!(
                "expected {} particle entries ({} x {}), got {}",
                n_particle * n_batch,
                n_particle,
                n_batch,
                data.len()
            )));
        }
        Ok(Self {
            n_particle,
            n_batch,
            data,
        })
    }

    pub fn n_particle(&self) -> usize {
        self.n_particle
    }

    pub fn n_batch(&self) -> usize {
        self.n_batch
    }

    pub fn get(&self, particle: usize, batch: usize) -> &T {
        &self.data[particle * self.n_batch + batch]
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.data.iter()
    }

    /// All particles of one batch element, in particle order.
    pub fn batch(&self, batch: usize) -> impl Iterator<Item = &T> {
        (0..self.n_particle).map(move |p| self.get(p, batch))
    }

    pub fn map<U>(&self, mut f: impl FnMut(&T) -> U) -> ParticleArray<U> {
        ParticleArray {
            n_particle: self.n_particle,
            n_batch: self.n_batch,
            data: self.data.iter().map(&mut f).collect(),
        }
    }

    pub fn same_shape<U>(&self, other: &ParticleArray<U>) -> bool {
        self.n_particle == other.n_particle && self.n_batch == other.n_batch
    }
}

impl<T: Clone> ParticleArray<T> {
    /// Repeat one value per batch element across `n_particle` particles.
    pub fn broadcast(n_particle: usize, per_batch: &[T]) -> Self {
        Self::from_fn(n_particle, per_batch.len(), |_, b| per_batch[b].clone())
    }
}

impl ParticleArray<usize> {
    /// Identity ancestry: every particle is its own ancestor.
    pub fn identity(n_particle: usize, n_batch: usize) -> Self {
        Self::from_fn(n_particle, n_batch, |p, _| p)
    }
}

impl<T> Index<(usize, usize)> for ParticleArray<T> {
    type Output = T;

    fn index(&self, (particle, batch): (usize, usize)) -> &T {
        self.get(particle, batch)
    }
}

/// Gather along the particle axis.
///
/// `resample_mask[b]` selects which batch elements take their ancestors from `ancestors`;
/// unselected batch elements are passed through unchanged.
pub trait Resample: Sized {
    fn resample(&self, ancestors: &AncestorIndices, resample_mask: &[bool]) -> Self;
}

impl<T: Clone> Resample for ParticleArray<T> {
    fn resample(&self, ancestors: &AncestorIndices, resample_mask: &[bool]) -> Self {
        debug_assert!(self.same_shape(ancestors));
        ParticleArray::from_fn(self.n_particle, self.n_batch, |p, b| {
            if resample_mask[b] {
                self.get(ancestors[(p, b)], b).clone()
            } else {
                self.get(p, b).clone()
            }
        })
    }
}

/// Absent fields are skipped and come back absent.
impl<T: Resample> Resample for Option<T> {
    fn resample(&self, ancestors: &AncestorIndices, resample_mask: &[bool]) -> Self {
        self.as_ref().map(|v| v.resample(ancestors, resample_mask))
    }
}

/// Named collections of per-particle fields.
impl<K: Ord + Clone, V: Resample> Resample for BTreeMap<K, V> {
    fn resample(&self, ancestors: &AncestorIndices, resample_mask: &[bool]) -> Self {
        self.iter()
            .map(|(k, v)| (k.clone(), v.resample(ancestors, resample_mask)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_particle_major() {
        let a = ParticleArray::from_fn(3, 2, |p, b| 10 * p + b);
        assert_eq!(a[(2, 1)], 21);
        assert_eq!(a.batch(1).copied().collect::<Vec<_>>(), vec![1, 11, 21]);
        assert_eq!(a.iter().count(), 6);
    }

    #[test]
    fn from_vec_checks_length() {
        assert!(ParticleArray::from_vec(2, 2, vec![1, 2, 3]).is_err());
        assert!(ParticleArray::from_vec(2, 2, vec![1, 2, 3, 4]).is_ok());
    }

    #[test]
    fn broadcast_repeats_per_batch_value() {
        let a = ParticleArray::broadcast(3, &["x", "y"]);
        assert_eq!(a[(0, 0)], "x");
        assert_eq!(a[(2, 1)], "y");
    }

    #[test]
    fn resample_gathers_only_masked_batches() {
        let a = ParticleArray::from_fn(3, 2, |p, b| 10 * p + b);
        let ancestors = ParticleArray::from_fn(3, 2, |_, _| 2);
        let r = a.resample(&ancestors, &[true, false]);
        assert_eq!(r.batch(0).copied().collect::<Vec<_>>(), vec![20, 20, 20]);
        assert_eq!(r.batch(1).copied().collect::<Vec<_>>(), vec![1, 11, 21]);
    }

    #[test]
    fn resample_skips_absent_fields() {
        let ancestors = AncestorIndices::identity(2, 1);
        let absent: Option<ParticleArray<f64>> = None;
        assert!(absent.resample(&ancestors, &[true]).is_none());

        let mut fields = BTreeMap::new();
        fields.insert("m", Some(ParticleArray::from_fn(2, 1, |p, _| p as f64)));
        fields.insert("x", None);
        let out = fields.resample(&AncestorIndices::from_fn(2, 1, |_, _| 1), &[true]);
        assert!(out["x"].is_none());
        assert_eq!(out["m"].as_ref().unwrap()[(0, 0)], 1.0);
    }
}
