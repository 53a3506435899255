//! Who may see what.
//!
//! Internal actors see everything. Everyone else sees public bugs, plus the
//! private bugs that explicitly list them in `also_visible_to`. Private
//! comments are internal-only regardless of grants.

use crate::models::{ActorInfo, Bug, Comment};
use crate::traits::ActorResolver;

/// Objects whose visibility depends on the viewer.
pub trait PartiallyVisible {
    fn is_visible_to(&self, actor: &ActorInfo) -> bool;
}

impl PartiallyVisible for Bug {
    fn is_visible_to(&self, actor: &ActorInfo) -> bool {
        actor.internal || !self.private || self.also_visible_to.iter().any(|a| a == &actor.id)
    }
}

impl PartiallyVisible for Comment {
    fn is_visible_to(&self, actor: &ActorInfo) -> bool {
        actor.internal || !self.private
    }
}

/// Keep only the addresses that can see `object`.
///
/// Unknown addresses resolve to plain users and are filtered accordingly.
pub async fn visible_recipients<T>(
    object: &T,
    candidates: impl IntoIterator<Item = String>,
    resolver: &dyn ActorResolver,
) -> Vec<String>
where
    T: PartiallyVisible + Sync + ?Sized,
{
    let mut visible = Vec::new();
    for candidate in candidates {
        let actor = resolver.resolve_or_default(&candidate).await;
        if object.is_visible_to(&actor) {
            visible.push(candidate);
        }
    }
    visible
}
