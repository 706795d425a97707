// Fallback resolution: which instance actually backs a widget.
//
// Pure function of the configured id and the accessible set. The caller
// (InstanceResolver) layers the stability cache and persistence on top.

use skydeck_api::{InstanceId, ServiceKind};

use crate::access::InstanceRef;

/// Why the decision came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    /// The accessible set has not loaded yet.
    Loading,
    /// Nothing configured and nothing compatible to fall back to.
    NotConfigured,
    /// Configured instance inaccessible and no compatible substitute.
    NoAccess,
    /// An effective instance was resolved.
    Accessible,
}

/// The resolved binding for one widget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackDecision {
    pub configured_id: Option<InstanceId>,
    pub effective_id: Option<InstanceId>,
    pub is_fallback: bool,
    pub reason: FallbackReason,
}

impl FallbackDecision {
    pub(crate) fn loading(configured_id: Option<InstanceId>) -> Self {
        Self {
            configured_id,
            effective_id: None,
            is_fallback: false,
            reason: FallbackReason::Loading,
        }
    }

    /// Whether the widget can render data with this decision.
    pub fn is_resolved(&self) -> bool {
        self.reason == FallbackReason::Accessible
    }
}

/// Resolve the effective instance for a widget.
///
/// `compatible` is the set of service kinds the widget can render;
/// only accessible instances of those kinds are candidates.
pub fn resolve(
    configured: Option<&InstanceId>,
    compatible: &[ServiceKind],
    accessible: &[InstanceRef],
) -> FallbackDecision {
    let candidates: Vec<&InstanceRef> = accessible
        .iter()
        .filter(|instance| compatible.contains(&instance.kind))
        .collect();

    let configured_id = configured.cloned();
    let substitute = |reason_if_empty: FallbackReason| match candidates.first() {
        Some(first) => FallbackDecision {
            configured_id: configured_id.clone(),
            effective_id: Some(first.id.clone()),
            is_fallback: true,
            reason: FallbackReason::Accessible,
        },
        None => FallbackDecision {
            configured_id: configured_id.clone(),
            effective_id: None,
            is_fallback: false,
            reason: reason_if_empty,
        },
    };

    match configured {
        // Never configured: auto-select the first compatible instance.
        None => substitute(FallbackReason::NotConfigured),

        // Steady state: the configured instance is accessible.
        Some(id) if candidates.iter().any(|instance| &instance.id == id) => FallbackDecision {
            configured_id: configured_id.clone(),
            effective_id: Some(id.clone()),
            is_fallback: false,
            reason: FallbackReason::Accessible,
        },

        // Deleted, un-shared, or someone else's: substitute.
        Some(_) => substitute(FallbackReason::NoAccess),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const COMPATIBLE: &[ServiceKind] = &[ServiceKind::Jellyfin, ServiceKind::Plex];

    fn refs(ids: &[(&str, ServiceKind)]) -> Vec<InstanceRef> {
        ids.iter()
            .map(|(id, kind)| InstanceRef {
                id: (*id).into(),
                kind: *kind,
                name: (*id).to_owned(),
            })
            .collect()
    }

    #[test]
    fn configured_and_accessible_is_the_steady_state() {
        let accessible = refs(&[
            ("x", ServiceKind::Jellyfin),
            ("y", ServiceKind::Jellyfin),
        ]);
        let decision = resolve(Some(&"x".into()), COMPATIBLE, &accessible);
        assert_eq!(decision.effective_id, Some("x".into()));
        assert!(!decision.is_fallback);
        assert_eq!(decision.reason, FallbackReason::Accessible);
    }

    #[test]
    fn inaccessible_configured_substitutes_the_first_compatible() {
        let accessible = refs(&[
            ("y", ServiceKind::Jellyfin),
            ("z", ServiceKind::Jellyfin),
        ]);
        let decision = resolve(Some(&"x".into()), COMPATIBLE, &accessible);
        assert_eq!(decision.effective_id, Some("y".into()));
        assert!(decision.is_fallback);
        assert_eq!(decision.reason, FallbackReason::Accessible);
    }

    #[test]
    fn empty_accessible_set_is_no_access() {
        let decision = resolve(Some(&"x".into()), COMPATIBLE, &[]);
        assert_eq!(decision.effective_id, None);
        assert_eq!(decision.reason, FallbackReason::NoAccess);
    }

    #[test]
    fn incompatible_instances_are_not_candidates() {
        // Accessible, but the wrong kind for this widget.
        let accessible = refs(&[("dl", ServiceKind::QBittorrent)]);
        let decision = resolve(Some(&"x".into()), COMPATIBLE, &accessible);
        assert_eq!(decision.reason, FallbackReason::NoAccess);
    }

    #[test]
    fn unconfigured_widget_auto_selects() {
        let accessible = refs(&[
            ("dl", ServiceKind::QBittorrent),
            ("jf", ServiceKind::Jellyfin),
        ]);
        let decision = resolve(None, COMPATIBLE, &accessible);
        assert_eq!(decision.effective_id, Some("jf".into()));
        assert!(decision.is_fallback);
    }

    #[test]
    fn unconfigured_widget_with_no_candidates_is_not_configured() {
        let decision = resolve(None, COMPATIBLE, &[]);
        assert_eq!(decision.effective_id, None);
        assert_eq!(decision.reason, FallbackReason::NotConfigured);
    }

    #[test]
    fn accessible_decisions_always_carry_an_effective_id() {
        // The invariant widgets rely on: reason == Accessible implies a
        // member of the accessible set.
        let accessible = refs(&[("a", ServiceKind::Plex)]);
        for configured in [None, Some(InstanceId::from("a")), Some(InstanceId::from("gone"))] {
            let decision = resolve(configured.as_ref(), COMPATIBLE, &accessible);
            if decision.reason == FallbackReason::Accessible {
                let id = decision.effective_id.expect("accessible implies an id");
                assert!(accessible.iter().any(|r| r.id == id));
            }
        }
    }
}
