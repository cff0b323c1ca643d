use relay_core::RelayError;
use serde::Serialize;

/// A contiguous run of particle indices handled by one scheduler job per
/// queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Partition {
    pub index: usize,
    pub first: u64,
    pub last: u64,
}

impl Partition {
    /// Particle count; never zero.
    pub fn size(&self) -> u64 {
        self.last - self.first + 1
    }
}

/// Splits `[1, particles]` into `division` ranges. The first `division - 1`
/// ranges get `particles / division` indices each; the last one takes the
/// remainder.
pub fn partition_particles(particles: u64, division: u64) -> Result<Vec<Partition>, RelayError> {
    if division == 0 {
        return Err(RelayError::config("division must be greater than zero"));
    }
    if division > particles {
        return Err(RelayError::config(format!(
            "cannot split {} particles into {} partitions",
            particles, division
        )));
    }
    let each = particles / division;
    let parts = (0..division)
        .map(|d| {
            let first = 1 + d * each;
            let last = if d == division - 1 {
                particles
            } else {
                (d + 1) * each
            };
            Partition {
                index: d as usize,
                first,
                last,
            }
        })
        .collect();
    Ok(parts)
}
