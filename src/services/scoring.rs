//! Interest scoring for decrypted activity events.
//!
//! A post's score combines two baselines on one scale:
//! - up to 2.0 relative to how much *other* users engage with the post,
//! - up to 2.0 relative to how much this user engages with posts overall.
//!
//! The total lives in `[0, 4]`, which makes scored activity comparable to
//! the fixed fallback scores (authored posts 3.0, strong upvotes 1.2).

/// Fixed score attached to the user's own authored posts when filling.
pub const AUTHORED_SCORE: f64 = 3.0;

/// Fixed score attached to posts the user up-voted strongly when filling.
pub const UPVOTED_SCORE: f64 = 1.2;

fn clamp(value: f64, min: f64, max: f64) -> f64 {
    value.max(min).min(max)
}

/// Scores one event count against the global and personal averages.
///
/// Each contribution is zero when its average is zero (no baseline means no
/// signal); a result of exactly `0.0` means "no measurable interest" and the
/// post is dropped from the result set by the caller.
pub fn interest_score(event_count: f64, global_average: f64, personal_average: f64) -> f64 {
    if event_count <= 0.0 {
        return 0.0;
    }

    let mut score = 0.0;
    if global_average > 0.0 {
        score += clamp(event_count / global_average, 0.0, 2.0);
    }
    if personal_average > 0.0 {
        score += clamp(event_count / personal_average, 0.0, 2.0);
    }
    score
}
