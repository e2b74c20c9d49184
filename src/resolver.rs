//! State machine backing one address-like input field.
//!
//! The phase is a tagged union, so the illegal combinations the old
//! free-form record allowed (verified without coordinates, suggestions
//! outside of typing, a dangling error message) cannot be constructed.
//! Effect orchestration lives in `app::update`; everything here is a pure
//! transition.

use serde::{Deserialize, Serialize};

use crate::{AppError, ValidatedCoordinate};

pub const SUGGESTION_DEBOUNCE_MS: u64 = 300;
/// Suggestions are only fetched once the query has more characters than
/// this.
pub const MIN_SUGGEST_QUERY_CHARS: usize = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResolverPhase {
    Idle,
    Typing { suggestions: Vec<String> },
    Verifying { query: String },
    Geolocating,
    Verified { coordinates: ValidatedCoordinate },
    Failed { error: AppError },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolverState {
    pub text: String,
    pub phase: ResolverPhase,
    /// Bumped on every user-initiated change. Async outcomes carry the
    /// generation they were issued under and are discarded on mismatch.
    pub generation: u64,
}

impl ResolverState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            text: String::new(),
            phase: ResolverPhase::Idle,
            generation: 0,
        }
    }

    /// A field restored with known-good text and coordinates starts out
    /// verified.
    #[must_use]
    pub fn seeded(text: impl Into<String>, coordinates: ValidatedCoordinate) -> Self {
        Self {
            text: text.into(),
            phase: ResolverPhase::Verified { coordinates },
            generation: 0,
        }
    }

    #[must_use]
    pub fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }

    #[must_use]
    pub const fn is_typing(&self) -> bool {
        matches!(self.phase, ResolverPhase::Typing { .. })
    }

    #[must_use]
    pub const fn is_verifying(&self) -> bool {
        matches!(self.phase, ResolverPhase::Verifying { .. })
    }

    #[must_use]
    pub const fn is_geolocating(&self) -> bool {
        matches!(self.phase, ResolverPhase::Geolocating)
    }

    /// In-flight work (verification or a position fix) that a second
    /// request must not race.
    #[must_use]
    pub const fn is_busy(&self) -> bool {
        self.is_verifying() || self.is_geolocating()
    }

    #[must_use]
    pub const fn coordinates(&self) -> Option<ValidatedCoordinate> {
        match self.phase {
            ResolverPhase::Verified { coordinates } => Some(coordinates),
            _ => None,
        }
    }

    #[must_use]
    pub fn suggestions(&self) -> &[String] {
        match &self.phase {
            ResolverPhase::Typing { suggestions } => suggestions,
            _ => &[],
        }
    }

    #[must_use]
    pub fn error(&self) -> Option<&AppError> {
        match &self.phase {
            ResolverPhase::Failed { error } => Some(error),
            _ => None,
        }
    }

    /// Every edit lands in `Typing`, dropping any verified coordinates or
    /// error. Returns whether a debounced suggestion fetch should be
    /// scheduled for the new text.
    pub fn set_text(&mut self, text: impl Into<String>) -> bool {
        let text = text.into();
        self.generation += 1;
        let wants_suggestions = text.chars().count() > MIN_SUGGEST_QUERY_CHARS;
        let suggestions = match (&mut self.phase, wants_suggestions) {
            // keep showing the previous candidates while the next fetch settles
            (ResolverPhase::Typing { suggestions }, true) => std::mem::take(suggestions),
            _ => Vec::new(),
        };
        self.text = text;
        self.phase = ResolverPhase::Typing { suggestions };
        wants_suggestions
    }

    /// Picking a candidate fixes the text and clears the list; the caller
    /// starts verification right away.
    pub fn choose_suggestion(&mut self, text: impl Into<String>) {
        self.generation += 1;
        self.text = text.into();
        self.phase = ResolverPhase::Typing {
            suggestions: Vec::new(),
        };
    }

    pub fn begin_verify(&mut self) {
        self.generation += 1;
        self.phase = ResolverPhase::Verifying {
            query: self.text.clone(),
        };
    }

    pub fn begin_geolocate(&mut self) {
        self.generation += 1;
        self.phase = ResolverPhase::Geolocating;
    }

    /// Terminal success: canonical display text plus the resolved point.
    pub fn verified(&mut self, text: impl Into<String>, coordinates: ValidatedCoordinate) {
        self.text = text.into();
        self.phase = ResolverPhase::Verified { coordinates };
    }

    /// A known-good point picked on the map; no network involved.
    pub fn select_point(&mut self, name: impl Into<String>, coordinates: ValidatedCoordinate) {
        self.generation += 1;
        self.verified(name, coordinates);
    }

    pub fn fail(&mut self, error: AppError) {
        self.phase = ResolverPhase::Failed { error };
    }

    /// Replace the candidate list, but only while still typing the same
    /// text the fetch was issued for.
    pub fn apply_suggestions(&mut self, generation: u64, items: Vec<String>) {
        if !self.is_current(generation) {
            return;
        }
        if let ResolverPhase::Typing { suggestions } = &mut self.phase {
            *suggestions = items;
        }
    }

    pub fn reset(&mut self) {
        self.generation += 1;
        self.text.clear();
        self.phase = ResolverPhase::Idle;
    }
}

impl Default for ResolverState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    fn point(lat: f64, lon: f64) -> ValidatedCoordinate {
        ValidatedCoordinate::new(lat, lon).unwrap()
    }

    #[test]
    fn starts_idle_and_empty() {
        let resolver = ResolverState::new();
        assert_eq!(resolver.phase, ResolverPhase::Idle);
        assert_eq!(resolver.text, "");
        assert!(resolver.coordinates().is_none());
        assert!(resolver.suggestions().is_empty());
    }

    #[test]
    fn seeded_state_is_verified() {
        let resolver = ResolverState::seeded("Home", point(12.9, 77.6));
        assert_eq!(resolver.coordinates(), Some(point(12.9, 77.6)));
        assert_eq!(resolver.text, "Home");
    }

    #[test]
    fn short_text_wants_no_suggestions() {
        let mut resolver = ResolverState::new();
        assert!(!resolver.set_text("pa"));
        assert!(resolver.suggestions().is_empty());
        assert!(resolver.set_text("par"));
    }

    #[test]
    fn editing_drops_coordinates_and_error() {
        let mut resolver = ResolverState::seeded("Home", point(12.9, 77.6));
        resolver.set_text("somewhere else");
        assert!(resolver.coordinates().is_none());
        assert!(resolver.is_typing());

        resolver.fail(AppError::new(ErrorKind::Geocoding, "boom"));
        assert!(resolver.error().is_some());
        resolver.set_text("try again");
        assert!(resolver.error().is_none());
    }

    #[test]
    fn each_edit_bumps_the_generation() {
        let mut resolver = ResolverState::new();
        let g0 = resolver.generation;
        resolver.set_text("a");
        resolver.set_text("ab");
        assert_eq!(resolver.generation, g0 + 2);
        assert!(resolver.is_current(g0 + 2));
        assert!(!resolver.is_current(g0 + 1));
    }

    #[test]
    fn stale_suggestions_are_discarded() {
        let mut resolver = ResolverState::new();
        resolver.set_text("par");
        let stale = resolver.generation;
        resolver.set_text("pari");
        resolver.apply_suggestions(stale, vec!["Paris".into()]);
        assert!(resolver.suggestions().is_empty());

        resolver.apply_suggestions(resolver.generation, vec!["Paris".into()]);
        assert_eq!(resolver.suggestions(), ["Paris".to_string()]);
    }

    #[test]
    fn suggestions_survive_while_typing_continues() {
        let mut resolver = ResolverState::new();
        resolver.set_text("par");
        resolver.apply_suggestions(resolver.generation, vec!["Paris, France".into()]);
        resolver.set_text("pari");
        assert_eq!(resolver.suggestions(), ["Paris, France".to_string()]);
        resolver.set_text("pa");
        assert!(resolver.suggestions().is_empty());
    }

    #[test]
    fn choosing_a_suggestion_clears_the_list() {
        let mut resolver = ResolverState::new();
        resolver.set_text("par");
        resolver.apply_suggestions(resolver.generation, vec!["Paris, France".into()]);
        resolver.choose_suggestion("Paris, France");
        assert_eq!(resolver.text, "Paris, France");
        assert!(resolver.suggestions().is_empty());
    }

    #[test]
    fn verify_transitions_through_verifying() {
        let mut resolver = ResolverState::new();
        resolver.set_text("Paris");
        resolver.begin_verify();
        assert!(resolver.is_busy());
        assert_eq!(
            resolver.phase,
            ResolverPhase::Verifying {
                query: "Paris".into()
            }
        );

        resolver.verified("Paris, France", point(48.85, 2.35));
        assert_eq!(resolver.text, "Paris, France");
        assert_eq!(resolver.coordinates(), Some(point(48.85, 2.35)));
    }

    #[test]
    fn geolocating_counts_as_busy() {
        let mut resolver = ResolverState::new();
        resolver.begin_geolocate();
        assert!(resolver.is_busy());
        assert!(resolver.is_geolocating());
    }

    #[test]
    fn map_pick_is_verified_without_any_query() {
        let mut resolver = ResolverState::new();
        resolver.select_point("X", point(12.9, 77.6));
        assert_eq!(resolver.coordinates(), Some(point(12.9, 77.6)));
        assert_eq!(resolver.text, "X");
    }

    #[test]
    fn reset_returns_to_initial_shape() {
        let mut resolver = ResolverState::seeded("Home", point(12.9, 77.6));
        let generation = resolver.generation;
        resolver.reset();
        assert_eq!(resolver.phase, ResolverPhase::Idle);
        assert_eq!(resolver.text, "");
        assert!(resolver.generation > generation);
    }
}
