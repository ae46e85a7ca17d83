//! Candidate pipeline: `Seed → (Escalate?) → Automatic → Filter → Select`.
//!
//! Every stage takes the accumulated pool and makes at most one kind of oracle call,
//! so the whole policy can be driven by a fake oracle in tests.

use std::fmt;

use image::RgbImage;
use tracing::{debug, debug_span};

use crate::errors::{Result, SpriteCutoutError};
use crate::maskops::Mask;
use crate::prompts::{central_box, plan_points, PromptSet, UserPoints};
use crate::scoring::{score_auto, score_point};
use crate::traits::SegmentationOracle;

/// Candidates touching more of the border than this are filtered out.
pub const MAX_BORDER_TOUCH: f64 = 0.08;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateSource {
    PointSeed,
    PointExpanded,
    PointExpandedBox,
    Auto,
}

impl CandidateSource {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PointSeed => "point-seed",
            Self::PointExpanded => "point-expanded",
            Self::PointExpandedBox => "point-expanded-box",
            Self::Auto => "auto",
        }
    }
}

impl fmt::Display for CandidateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub mask: Mask,
    pub score: f64,
    pub source: CandidateSource,
}

/// Area preferences shared by scoring, escalation and the acceptance filter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SelectionSettings {
    pub target_area: f64,
    pub min_area: f64,
    pub max_area: f64,
}

impl Default for SelectionSettings {
    fn default() -> Self {
        Self {
            target_area: 0.30,
            min_area: 0.15,
            max_area: 0.90,
        }
    }
}

impl SelectionSettings {
    pub fn in_band(&self, area: f64) -> bool {
        (self.min_area..=self.max_area).contains(&area)
    }

    /// Area band plus the border-touch ceiling.
    pub fn accepts(&self, mask: &Mask) -> bool {
        self.in_band(mask.area_fraction()) && mask.border_touch() <= MAX_BORDER_TOUCH
    }
}

/// Outcome of the pipeline for one image.
#[derive(Debug, Clone)]
pub struct Selection {
    pub mask: Mask,
    pub score: f64,
    pub source: CandidateSource,
    /// Area of the best seed candidate, which drove escalation.
    pub seed_area: f64,
    pub candidate_count: usize,
    pub filtered_count: usize,
    pub escalated: bool,
}

/// Highest score wins; the earliest candidate wins a tie.
pub fn best_candidate<'a, I>(candidates: I) -> Option<&'a Candidate>
where
    I: IntoIterator<Item = &'a Candidate>,
{
    candidates.into_iter().fold(None, |best, candidate| match best {
        Some(current) if current.score >= candidate.score => Some(current),
        _ => Some(candidate),
    })
}

fn query_points<O: SegmentationOracle>(
    oracle: &O,
    prompt: &PromptSet,
    source: CandidateSource,
    settings: &SelectionSettings,
    pool: &mut Vec<Candidate>,
) -> Result<usize> {
    let _span = debug_span!("predict", %source, points = prompt.points.len()).entered();
    let masks = oracle.predict(prompt, true)?;
    let added = masks.len();
    pool.extend(masks.into_iter().map(|scored| Candidate {
        score: score_point(&scored.mask, scored.confidence, settings.target_area),
        mask: scored.mask,
        source,
    }));
    Ok(added)
}

/// Seed stage: base point prompts, no box, multimask output.
pub fn seed<O: SegmentationOracle>(
    oracle: &O,
    (width, height): (u32, u32),
    user: &UserPoints,
    settings: &SelectionSettings,
    pool: &mut Vec<Candidate>,
) -> Result<usize> {
    let prompt = plan_points(width, height, false, user);
    query_points(oracle, &prompt, CandidateSource::PointSeed, settings, pool)
}

/// Area of the best candidate in `pool`, or `None` for an empty pool.
pub fn best_area(pool: &[Candidate]) -> Option<f64> {
    best_candidate(pool).map(|c| c.mask.area_fraction())
}

pub fn needs_escalation(seed_area: f64, settings: &SelectionSettings) -> bool {
    !settings.in_band(seed_area)
}

/// Escalation stage: expanded points, then expanded points with the central box.
pub fn escalate<O: SegmentationOracle>(
    oracle: &O,
    (width, height): (u32, u32),
    user: &UserPoints,
    settings: &SelectionSettings,
    pool: &mut Vec<Candidate>,
) -> Result<usize> {
    let expanded = plan_points(width, height, true, user);
    let mut added = query_points(
        oracle,
        &expanded,
        CandidateSource::PointExpanded,
        settings,
        pool,
    )?;
    let boxed = expanded.with_box(central_box(width, height));
    added += query_points(
        oracle,
        &boxed,
        CandidateSource::PointExpandedBox,
        settings,
        pool,
    )?;
    Ok(added)
}

/// Automatic stage: whole-image proposals scored with `score_auto`.
pub fn automatic<O: SegmentationOracle>(
    oracle: &O,
    image: &RgbImage,
    settings: &SelectionSettings,
    pool: &mut Vec<Candidate>,
) -> Result<usize> {
    let _span = debug_span!("generate_automatic").entered();
    let masks = oracle.generate_automatic(image)?;
    let added = masks.len();
    pool.extend(masks.into_iter().map(|auto| Candidate {
        score: score_auto(
            &auto.mask,
            auto.predicted_iou,
            auto.stability_score,
            settings.target_area,
        ),
        mask: auto.mask,
        source: CandidateSource::Auto,
    }));
    Ok(added)
}

/// Candidates passing the acceptance filter. Falls back to the whole pool when none do.
///
/// The second value is the number of candidates that passed.
pub fn acceptance_filter<'a>(
    pool: &'a [Candidate],
    settings: &SelectionSettings,
) -> (Vec<&'a Candidate>, usize) {
    let accepted: Vec<_> = pool.iter().filter(|c| settings.accepts(&c.mask)).collect();
    let passed = accepted.len();
    if accepted.is_empty() {
        debug!(pool = pool.len(), "no candidate passed the acceptance filter; using the full pool");
        (pool.iter().collect(), passed)
    } else {
        (accepted, passed)
    }
}

/// Runs every stage for one image. `name` only labels errors.
pub fn select<O: SegmentationOracle>(
    oracle: &O,
    image: &RgbImage,
    user: &UserPoints,
    settings: &SelectionSettings,
    name: &str,
) -> Result<Selection> {
    let dimensions = image.dimensions();
    oracle.set_image(image)?;

    let mut pool = Vec::new();
    seed(oracle, dimensions, user, settings, &mut pool)?;
    let seed_area = best_area(&pool).ok_or_else(|| SpriteCutoutError::NoCandidates {
        path: name.to_string(),
    })?;

    let escalated = needs_escalation(seed_area, settings);
    if escalated {
        debug!(seed_area, "seed area outside the acceptance band; escalating");
        escalate(oracle, dimensions, user, settings, &mut pool)?;
    }

    automatic(oracle, image, settings, &mut pool)?;

    let (active, filtered_count) = acceptance_filter(&pool, settings);
    let winner = best_candidate(active.into_iter()).ok_or_else(|| {
        SpriteCutoutError::NoCandidates {
            path: name.to_string(),
        }
    })?;

    Ok(Selection {
        mask: winner.mask.clone(),
        score: winner.score,
        source: winner.source,
        seed_area,
        candidate_count: pool.len(),
        filtered_count,
        escalated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{rect_mask, FixtureOracle};
    use crate::traits::{AutoMask, ScoredMask};

    fn candidate(mask: Mask, score: f64, source: CandidateSource) -> Candidate {
        Candidate {
            mask,
            score,
            source,
        }
    }

    #[test]
    fn test_source_labels() {
        assert_eq!(CandidateSource::PointSeed.to_string(), "point-seed");
        assert_eq!(CandidateSource::PointExpanded.to_string(), "point-expanded");
        assert_eq!(
            CandidateSource::PointExpandedBox.to_string(),
            "point-expanded-box"
        );
        assert_eq!(CandidateSource::Auto.to_string(), "auto");
    }

    #[test]
    fn test_best_candidate_prefers_first_on_tie() {
        let mask = Mask::new(4, 4);
        let pool = vec![
            candidate(mask.clone(), 0.5, CandidateSource::PointSeed),
            candidate(mask.clone(), 0.9, CandidateSource::PointExpanded),
            candidate(mask, 0.9, CandidateSource::Auto),
        ];
        let best = best_candidate(&pool).map(|c| c.source);
        assert_eq!(best, Some(CandidateSource::PointExpanded));
        assert!(best_candidate(&Vec::<Candidate>::new()).is_none());
    }

    #[test]
    fn test_acceptance_filter_excludes_border_masks() {
        let settings = SelectionSettings::default();
        let full = Mask::from_fn(100, 100, |_, _| true);
        let square = rect_mask(100, 100, 30, 30, 40, 40);
        let pool = vec![
            candidate(full, 5.0, CandidateSource::PointSeed),
            candidate(square, 0.1, CandidateSource::Auto),
        ];
        let (active, passed) = acceptance_filter(&pool, &settings);
        assert_eq!(passed, 1);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].source, CandidateSource::Auto);
    }

    #[test]
    fn test_acceptance_filter_falls_back_to_pool() {
        let settings = SelectionSettings::default();
        let pool = vec![
            candidate(rect_mask(100, 100, 45, 45, 5, 5), 1.0, CandidateSource::PointSeed),
            candidate(Mask::from_fn(100, 100, |_, _| true), 0.5, CandidateSource::Auto),
        ];
        let (active, passed) = acceptance_filter(&pool, &settings);
        assert_eq!(passed, 0);
        assert_eq!(active.len(), 2);
    }

    #[test]
    fn test_band_is_inclusive() {
        let settings = SelectionSettings::default();
        assert!(settings.in_band(0.15));
        assert!(settings.in_band(0.90));
        assert!(!settings.in_band(0.149));
        assert!(needs_escalation(0.05, &settings));
        assert!(needs_escalation(0.95, &settings));
        assert!(!needs_escalation(0.3, &settings));
    }

    #[test]
    fn test_empty_seed_pool_is_no_candidates() {
        let oracle = FixtureOracle::new(
            Vec::new(),
            vec![AutoMask::new(rect_mask(50, 50, 10, 10, 30, 30))],
        );
        let image = RgbImage::new(50, 50);
        let result = select(
            &oracle,
            &image,
            &UserPoints::default(),
            &SelectionSettings::default(),
            "empty.png",
        );
        assert!(matches!(
            result,
            Err(SpriteCutoutError::NoCandidates { ref path }) if path == "empty.png"
        ));
        // Nothing past the seed stage runs.
        assert_eq!(oracle.automatic_calls(), 0);
    }

    #[test]
    fn test_no_escalation_in_band() -> Result<()> {
        let square = rect_mask(100, 100, 30, 30, 40, 40);
        let oracle = FixtureOracle::new(
            vec![ScoredMask {
                mask: square.clone(),
                confidence: 0.95,
            }],
            Vec::new(),
        );
        let image = RgbImage::new(100, 100);
        let selection = select(
            &oracle,
            &image,
            &UserPoints::default(),
            &SelectionSettings::default(),
            "square.png",
        )?;
        assert!(!selection.escalated);
        assert_eq!(selection.source, CandidateSource::PointSeed);
        assert!((selection.seed_area - 0.16).abs() < 1e-12);
        assert_eq!(selection.candidate_count, 1);
        assert_eq!(selection.filtered_count, 1);
        assert_eq!(oracle.prompts().len(), 1);
        assert_eq!(oracle.automatic_calls(), 1);
        Ok(())
    }

    #[test]
    fn test_escalation_issues_expanded_and_boxed_queries() -> Result<()> {
        let small = rect_mask(100, 100, 45, 40, 10, 20);
        let oracle = FixtureOracle::new(
            vec![ScoredMask {
                mask: small,
                confidence: 0.9,
            }],
            Vec::new(),
        );
        let user = UserPoints {
            foreground: vec![[50.0, 30.0]],
            background: Vec::new(),
        };
        let selection = select(
            &oracle,
            &RgbImage::new(100, 100),
            &user,
            &SelectionSettings::default(),
            "small.png",
        )?;
        assert!(selection.escalated);
        assert!((selection.seed_area - 0.02).abs() < 1e-12);
        assert_eq!(selection.candidate_count, 3);

        let prompts = oracle.prompts();
        assert_eq!(prompts.len(), 3);
        assert_eq!(prompts[0].foreground_count(), 6);
        assert!(prompts[0].bbox.is_none());
        assert_eq!(prompts[1].foreground_count(), 12);
        assert!(prompts[1].bbox.is_none());
        assert_eq!(prompts[2].foreground_count(), 12);
        assert_eq!(prompts[2].bbox, Some(central_box(100, 100)));
        Ok(())
    }

    #[test]
    fn test_auto_candidate_can_win() -> Result<()> {
        let oracle = FixtureOracle::new(
            vec![ScoredMask {
                mask: Mask::from_fn(100, 100, |_, _| true),
                confidence: 1.0,
            }],
            vec![AutoMask {
                mask: rect_mask(100, 100, 25, 25, 50, 50),
                predicted_iou: 0.9,
                stability_score: 0.95,
            }],
        );
        let selection = select(
            &oracle,
            &RgbImage::new(100, 100),
            &UserPoints::default(),
            &SelectionSettings::default(),
            "auto.png",
        )?;
        assert!(selection.escalated);
        assert_eq!(selection.source, CandidateSource::Auto);
        assert_eq!(selection.filtered_count, 1);
        Ok(())
    }
}
