//! Rating and compatibility stores.
//!
//! A rating scores how stable a factory is; a compatibility scores how well
//! two factories behave when hosted by the same isolate. Both are 0..=100
//! and evolve with crashes and quiet timer ticks. Each store holds its own
//! lock; callers never need to coordinate.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, info};

/// Scores under this threshold flag a factory unstable or a pair incompatible.
pub const FLAG_THRESHOLD: u8 = 5;

const RECENT_CRASH: Duration = Duration::from_secs(60);
const LONG_QUIET: Duration = Duration::from_secs(120);

fn clamp(score: i64) -> u8 {
    score.clamp(0, 100) as u8
}

fn since(last: Option<Instant>, now: Instant) -> Option<Duration> {
    last.map(|last| now.saturating_duration_since(last))
}

// ── Ratings ───────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct RatingState {
    ratings: HashMap<String, u8>,
    last_crash: HashMap<String, Instant>,
    unstable: HashSet<String>,
}

/// Factory → stability score.
#[derive(Debug)]
pub struct RatingStore {
    default: u8,
    state: Mutex<RatingState>,
}

impl RatingStore {
    pub fn new(default: u8) -> Self {
        Self {
            default: default.min(100),
            state: Mutex::new(RatingState::default()),
        }
    }

    pub fn default_rating(&self) -> u8 {
        self.default
    }

    /// Set a rating, clamped to 0..=100.
    pub fn store(&self, factory: &str, score: i64) -> u8 {
        let score = clamp(score);
        let mut state = self.lock();
        state.ratings.insert(factory.to_string(), score);
        if score < FLAG_THRESHOLD {
            state.unstable.insert(factory.to_string());
        }
        score
    }

    pub fn get(&self, factory: &str) -> u8 {
        self.lock()
            .ratings
            .get(factory)
            .copied()
            .unwrap_or(self.default)
    }

    /// Stored rating, without falling back to the default.
    pub fn rating(&self, factory: &str) -> Option<u8> {
        self.lock().ratings.get(factory).copied()
    }

    /// Apply a delta to a rating. Returns the new, clamped value.
    pub fn update(&self, factory: &str, delta: i64) -> u8 {
        let mut state = self.lock();
        Self::apply(&mut state, self.default, factory, delta)
    }

    pub fn is_unstable(&self, factory: &str) -> bool {
        self.lock().unstable.contains(factory)
    }

    /// Mean rating of `factories`, using `unknown` for unrated ones.
    pub fn mean(&self, factories: &[&str], unknown: u8) -> Option<f64> {
        if factories.is_empty() {
            return None;
        }
        let state = self.lock();
        let total: u64 = factories
            .iter()
            .map(|f| u64::from(state.ratings.get(*f).copied().unwrap_or(unknown)))
            .sum();
        Some(total as f64 / factories.len() as f64)
    }

    /// The isolate hosting `factories` crashed.
    pub fn on_crash(&self, factories: &[String]) {
        self.on_crash_at(factories, Instant::now());
    }

    pub fn on_crash_at(&self, factories: &[String], now: Instant) {
        let mut state = self.lock();
        for factory in factories {
            if !state.unstable.contains(factory) {
                let recent = since(state.last_crash.get(factory).copied(), now)
                    .is_some_and(|elapsed| elapsed < RECENT_CRASH);
                let delta = if recent { -10 } else { -5 };
                Self::apply(&mut state, self.default, factory, delta);
            }
            state.last_crash.insert(factory.clone(), now);
        }
    }

    /// Timer tick: `factories` behaved since the previous tick.
    pub fn on_timer(&self, factories: &[String]) {
        self.on_timer_at(factories, Instant::now());
    }

    pub fn on_timer_at(&self, factories: &[String], now: Instant) {
        let mut state = self.lock();
        for factory in factories {
            if state.unstable.contains(factory) {
                continue;
            }
            let delta = match since(state.last_crash.get(factory).copied(), now) {
                None => 8,
                Some(elapsed) if elapsed > LONG_QUIET => 8,
                Some(elapsed) if elapsed > RECENT_CRASH => 4,
                Some(_) => 0,
            };
            if delta != 0 {
                Self::apply(&mut state, self.default, factory, delta);
            }
        }
    }

    fn apply(state: &mut RatingState, default: u8, factory: &str, delta: i64) -> u8 {
        let current = state.ratings.get(factory).copied().unwrap_or(default);
        let updated = clamp(i64::from(current) + delta);
        state.ratings.insert(factory.to_string(), updated);
        if updated < FLAG_THRESHOLD && state.unstable.insert(factory.to_string()) {
            info!(%factory, rating = updated, "factory flagged unstable");
        }
        updated
    }

    fn lock(&self) -> MutexGuard<'_, RatingState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ── Compatibility ─────────────────────────────────────────────────

type Pair = (String, String);

fn pair(a: &str, b: &str) -> Pair {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// Every unordered pair of distinct entries.
fn pairs(factories: &[String]) -> Vec<Pair> {
    let mut unique: Vec<&str> = factories.iter().map(String::as_str).collect();
    unique.sort_unstable();
    unique.dedup();
    let mut result = Vec::new();
    for (i, a) in unique.iter().enumerate() {
        for b in &unique[i + 1..] {
            result.push(pair(a, b));
        }
    }
    result
}

#[derive(Debug, Default)]
struct CompatibilityState {
    ratings: HashMap<Pair, u8>,
    last_crash: HashMap<Pair, Instant>,
    incompatible: HashSet<Pair>,
}

/// Unordered factory pair → compatibility score.
#[derive(Debug)]
pub struct CompatibilityStore {
    default: u8,
    state: Mutex<CompatibilityState>,
}

impl CompatibilityStore {
    pub fn new(default: u8) -> Self {
        Self {
            default: default.min(100),
            state: Mutex::new(CompatibilityState::default()),
        }
    }

    pub fn store(&self, a: &str, b: &str, score: i64) -> u8 {
        if a == b {
            return 100;
        }
        let score = clamp(score);
        let key = pair(a, b);
        let mut state = self.lock();
        if score < FLAG_THRESHOLD {
            state.incompatible.insert(key.clone());
        }
        state.ratings.insert(key, score);
        score
    }

    /// Compatibility of a pair. A factory is always fully compatible with itself.
    pub fn get(&self, a: &str, b: &str) -> u8 {
        self.rating(a, b).unwrap_or(self.default)
    }

    /// Stored compatibility, without falling back to the default.
    pub fn rating(&self, a: &str, b: &str) -> Option<u8> {
        if a == b {
            return Some(100);
        }
        self.lock().ratings.get(&pair(a, b)).copied()
    }

    pub fn update(&self, a: &str, b: &str, delta: i64) -> u8 {
        if a == b {
            return 100;
        }
        let mut state = self.lock();
        Self::apply(&mut state, self.default, pair(a, b), delta)
    }

    pub fn is_incompatible(&self, a: &str, b: &str) -> bool {
        a != b && self.lock().incompatible.contains(&pair(a, b))
    }

    /// The isolate hosting `factories` crashed: every pair of neighbours loses
    /// 3, or 5 when the same pair already crashed in the last minute.
    pub fn on_crash(&self, factories: &[String]) {
        self.on_crash_at(factories, Instant::now());
    }

    pub fn on_crash_at(&self, factories: &[String], now: Instant) {
        let mut state = self.lock();
        for key in pairs(factories) {
            let recent = since(state.last_crash.get(&key).copied(), now)
                .is_some_and(|elapsed| elapsed < RECENT_CRASH);
            let delta = if recent { -5 } else { -3 };
            state.last_crash.insert(key.clone(), now);
            Self::apply(&mut state, self.default, key, delta);
        }
    }

    /// Timer tick over healthy isolates, each given as its factories.
    /// Neighbours gain 10, or 2 when their last crash is under a minute old.
    pub fn on_timer(&self, isolates: &[Vec<String>]) {
        self.on_timer_at(isolates, Instant::now());
    }

    pub fn on_timer_at(&self, isolates: &[Vec<String>], now: Instant) {
        let mut state = self.lock();
        for factories in isolates {
            for key in pairs(factories) {
                if state.incompatible.contains(&key) {
                    continue;
                }
                let recent = since(state.last_crash.get(&key).copied(), now)
                    .is_some_and(|elapsed| elapsed <= RECENT_CRASH);
                let delta = if recent { 2 } else { 10 };
                Self::apply(&mut state, self.default, key, delta);
            }
        }
    }

    fn apply(state: &mut CompatibilityState, default: u8, key: Pair, delta: i64) -> u8 {
        let current = state.ratings.get(&key).copied().unwrap_or(default);
        let updated = clamp(i64::from(current) + delta);
        if updated < FLAG_THRESHOLD && !state.incompatible.contains(&key) {
            debug!(a = %key.0, b = %key.1, "pair flagged incompatible");
            state.incompatible.insert(key.clone());
        }
        state.ratings.insert(key, updated);
        updated
    }

    fn lock(&self) -> MutexGuard<'_, CompatibilityState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
