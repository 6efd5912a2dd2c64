use crate::types::{Embedding, UserTemplate};

/// Label shown for a face that matched nobody.
pub const UNKNOWN_LABEL: &str = "Unknown";

/// Distance reported when the gallery is empty.
pub const NO_MATCH_DISTANCE: f32 = 100.0;

/// Who a probe embedding belongs to.
#[derive(Debug, Clone, PartialEq)]
pub enum Identity {
    Known { key: String, name: String },
    Unknown,
}

/// Result of matching a probe embedding against the enrolled templates.
#[derive(Debug, Clone, PartialEq)]
pub struct Identification {
    pub identity: Identity,
    /// Euclidean distance to the nearest template, or [`NO_MATCH_DISTANCE`].
    pub distance: f32,
}

impl Identification {
    /// Display name, or [`UNKNOWN_LABEL`].
    pub fn name(&self) -> &str {
        match &self.identity {
            Identity::Known { name, .. } => name,
            Identity::Unknown => UNKNOWN_LABEL,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self.identity, Identity::Known { .. })
    }
}

/// Strategy for comparing a probe embedding against a gallery of enrolled faces.
pub trait Matcher {
    fn identify<'a, I>(&self, probe: &Embedding, gallery: I, threshold: f32) -> Identification
    where
        I: IntoIterator<Item = &'a UserTemplate>;
}

/// Nearest-centroid matcher over Euclidean distance.
///
/// A match requires the minimum distance to be no greater than the threshold.
/// Templates whose dimension differs from the probe are never candidates.
/// When two templates are at a bit-identical minimum distance the first one
/// yielded by the gallery wins; callers must not rely on which that is.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn identify<'a, I>(&self, probe: &Embedding, gallery: I, threshold: f32) -> Identification
    where
        I: IntoIterator<Item = &'a UserTemplate>,
    {
        let mut best: Option<(&UserTemplate, f32)> = None;

        for template in gallery {
            let Some(dist) = probe.euclidean_distance(&template.embedding) else {
                tracing::debug!(
                    key = %template.key,
                    probe_dim = probe.dim(),
                    template_dim = template.embedding.dim(),
                    "skipping template with mismatched dimension"
                );
                continue;
            };
            match best {
                Some((_, best_dist)) if dist >= best_dist => {}
                _ => best = Some((template, dist)),
            }
        }

        match best {
            Some((template, dist)) if dist <= threshold => Identification {
                identity: Identity::Known {
                    key: template.key.clone(),
                    name: template.name.clone(),
                },
                distance: dist,
            },
            Some((_, dist)) => Identification {
                identity: Identity::Unknown,
                distance: dist,
            },
            None => Identification {
                identity: Identity::Unknown,
                distance: NO_MATCH_DISTANCE,
            },
        }
    }
}
