use hashbrown::HashSet;
use itertools::Itertools;
use rand::{rngs::StdRng, Rng};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::image_pool::{CandidateImage, TagConstraints};

// Tile-grid footprint of the sprite slot being filled, derived from its
// current stencil.
#[derive(Copy, Clone, Debug)]
pub struct SlotShape {
    pub width_tiles: usize,
    pub height_tiles: usize,
    pub max_width_tiles: usize,
    pub max_height_tiles: usize,
}

// How well a candidate's tile dimensions fit the slot: the product of the
// width and height ratios, each in (0, 1], 1.0 for an exact match. None when
// the candidate exceeds the slot's quantized maximum in either direction.
pub fn size_score(candidate: &CandidateImage, shape: &SlotShape) -> Option<f64> {
    let cw = candidate.width.div_ceil(8);
    let ch = candidate.height.div_ceil(8);
    if cw > shape.max_width_tiles || ch > shape.max_height_tiles {
        return None;
    }
    let width_score = cw.min(shape.width_tiles) as f64 / cw.max(shape.width_tiles) as f64;
    let height_score = ch.min(shape.height_tiles) as f64 / ch.max(shape.height_tiles) as f64;
    Some(width_score * height_score)
}

fn tags_allow(candidate: &CandidateImage, constraints: Option<&TagConstraints>) -> bool {
    let Some(constraints) = constraints else {
        return true;
    };
    if !constraints.whitelist.is_empty() && !constraints.whitelist.is_subset(&candidate.tags) {
        return false;
    }
    if constraints.blacklist.intersection(&candidate.tags).next().is_some() {
        return false;
    }
    true
}

// Selects replacement assets for sprite slots. Every draw consumes the chosen
// filename, whether the caller ends up using it or rejecting it.
pub struct ImageMatcher {
    pool: Vec<CandidateImage>,
    used: HashSet<String>,
    seed: u64,
}

impl ImageMatcher {
    pub fn new(pool: Vec<CandidateImage>, seed: u64) -> Self {
        ImageMatcher {
            pool,
            used: HashSet::new(),
            seed,
        }
    }

    pub fn mark_used(&mut self, filename: &str) {
        self.used.insert(filename.to_string());
    }

    // Stable tie-break key: a candidate's rank among equal scores depends
    // only on its filename and the run seed.
    fn sig(&self, filename: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        filename.hash(&mut hasher);
        self.seed.hash(&mut hasher);
        hasher.finish()
    }

    // Pick one still-unused candidate for the slot, or None if the pool has
    // nothing acceptable left. Candidates are sorted ascending by fit, and
    // the selection index comes from three chained draws with rising lower
    // bounds; that skews the choice toward the best-fitting end of the list
    // while leaving every candidate reachable.
    pub fn pick(
        &self,
        shape: &SlotShape,
        constraints: Option<&TagConstraints>,
        rng: &mut StdRng,
    ) -> Option<&CandidateImage> {
        let ranked = self
            .pool
            .iter()
            .filter(|c| !self.used.contains(&c.filename))
            .filter(|c| tags_allow(c, constraints))
            .filter_map(|c| size_score(c, shape).map(|score| (score, self.sig(&c.filename), c)))
            .sorted_by(|a, b| {
                a.0.total_cmp(&b.0)
                    .then(a.1.cmp(&b.1))
                    .then(a.2.filename.cmp(&b.2.filename))
            })
            .collect_vec();
        if ranked.is_empty() {
            return None;
        }
        let max_index = ranked.len() - 1;
        let first = rng.gen_range(0..=max_index);
        let second = rng.gen_range(first..=max_index);
        let third = rng.gen_range(second..=max_index);
        Some(ranked[third].2)
    }
}
