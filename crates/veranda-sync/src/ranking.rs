//! Feed ranking policy.
//!
//! The engagement score is a business choice inherited from the product,
//! not a structural invariant of the engine: everything else only assumes
//! "posts sort by `rank_score` descending, creation time descending on
//! ties". Swapping the policy means changing this module and nothing else.

use veranda_core::FeedPost;

/// Weight of one like.
pub const LIKE_WEIGHT: f64 = 2.0;

/// Weight of one comment.
pub const COMMENT_WEIGHT: f64 = 1.0;

/// Weight of one view.
pub const VIEW_WEIGHT: f64 = 0.5;

/// Engagement score from raw counters.
pub fn rank_score(like_count: u64, comment_count: u64, view_count: u64) -> f64 {
    LIKE_WEIGHT * like_count as f64
        + COMMENT_WEIGHT * comment_count as f64
        + VIEW_WEIGHT * view_count as f64
}

/// Recompute a post's stored score from its current counters.
pub fn refresh(post: &mut FeedPost) {
    post.rank_score = rank_score(post.like_count, post.comment_count, post.view_count);
}
