//! Authorization decisions: deny by default.
//!
//! A request is allowed only when a role implies the action or a scope
//! matches it, and the target passes the token's resource constraints.
//! Wildcards are explicit: `*` as a whole scope, or `domain:*` for all
//! verbs in a domain; nothing matches implicitly.

use globset::Glob;

use crate::claims::Claims;
use crate::error::{AuthError, AuthResult};

/// Does a scope grant an action? Actions are `domain:verb` strings like
/// `queues:enqueue` or `dlq:purge`.
pub fn scope_matches(scope: &str, action: &str) -> bool {
    if scope == "*" || scope == action {
        return true;
    }
    match (scope.split_once(':'), action.split_once(':')) {
        (Some((scope_domain, "*")), Some((action_domain, _))) => scope_domain == action_domain,
        _ => false,
    }
}

/// Role table. Roles are coarse bundles; fine-grained grants use scopes.
pub fn role_allows(role: &str, action: &str) -> bool {
    match role {
        "admin" => true,
        "operator" => {
            // Day-to-day queue operations, but no tenant management and
            // no audit access.
            !action.starts_with("tenants:") && !action.starts_with("admin:")
        }
        "viewer" => {
            action.ends_with(":read")
                || action.ends_with(":list")
                || action.ends_with(":inspect")
        }
        _ => false,
    }
}

/// Does the target resource pass the token's constraints? Patterns are
/// textual globs (`payment-*`); an empty pattern list is unconstrained.
pub fn resource_allowed(claims: &Claims, resource: &str) -> bool {
    if claims.resources.queues.is_empty() || resource.is_empty() {
        return true;
    }
    claims.resources.queues.iter().any(|pattern| {
        Glob::new(pattern)
            .map(|g| g.compile_matcher().is_match(resource))
            .unwrap_or(false)
    })
}

/// The authorization decision.
pub fn authorize(claims: &Claims, action: &str, resource: &str) -> AuthResult<()> {
    let granted = claims.roles.iter().any(|r| role_allows(r, action))
        || claims.scopes.iter().any(|s| scope_matches(s, action));
    if !granted {
        return Err(AuthError::Forbidden(format!(
            "no role or scope grants {action}"
        )));
    }
    if !resource_allowed(claims, resource) {
        return Err(AuthError::Forbidden(format!(
            "resource {resource:?} outside token constraints"
        )));
    }
    Ok(())
}

/// Elevated operations (purge, bulk-destructive, rekey) additionally
/// need a step-up: either an `mfa` claim from issue time or a signed
/// confirmation verified by the caller beforehand.
pub fn require_step_up(claims: &Claims, confirmed: bool) -> AuthResult<()> {
    if claims.mfa || confirmed {
        Ok(())
    } else {
        Err(AuthError::StepUpRequired(
            "operation needs an mfa token or a signed confirmation".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scopes_match_exact_and_domain_wildcard() {
        assert!(scope_matches("queues:enqueue", "queues:enqueue"));
        assert!(scope_matches("queues:*", "queues:enqueue"));
        assert!(scope_matches("*", "dlq:purge"));

        assert!(!scope_matches("queues:*", "dlq:purge"));
        assert!(!scope_matches("queues:enqueue", "queues:purge"));
        // No implicit prefix matching.
        assert!(!scope_matches("queues", "queues:enqueue"));
    }

    #[test]
    fn roles_imply_actions() {
        assert!(role_allows("admin", "tenants:rekey"));
        assert!(role_allows("operator", "dlq:retry"));
        assert!(!role_allows("operator", "tenants:create"));
        assert!(!role_allows("operator", "admin:audit"));
        assert!(role_allows("viewer", "stats:read"));
        assert!(!role_allows("viewer", "queues:enqueue"));
        assert!(!role_allows("intern", "stats:read"));
    }

    #[test]
    fn deny_by_default() {
        let claims = Claims::new("svc");
        assert!(authorize(&claims, "queues:enqueue", "q").is_err());
    }

    #[test]
    fn scope_plus_resource_constraint() {
        let claims = Claims::new("svc")
            .with_scope("queues:enqueue")
            .with_queues(vec!["payment-*".into()]);
        assert!(authorize(&claims, "queues:enqueue", "payment-eu").is_ok());
        assert!(authorize(&claims, "queues:enqueue", "billing").is_err());
        assert!(authorize(&claims, "dlq:purge", "payment-eu").is_err());
    }

    #[test]
    fn empty_constraints_are_unconstrained() {
        let claims = Claims::new("svc").with_scope("queues:enqueue");
        assert!(authorize(&claims, "queues:enqueue", "anything").is_ok());
    }

    #[test]
    fn step_up_requires_mfa_or_confirmation() {
        let plain = Claims::new("svc");
        assert!(require_step_up(&plain, false).is_err());
        assert!(require_step_up(&plain, true).is_ok());
        assert!(require_step_up(&Claims::new("svc").with_mfa(), false).is_ok());
    }
}
