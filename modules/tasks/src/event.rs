//! Event naming and routing-key conventions.
//!
//! An event name is `<verb>_<subject>` (`update_space`, `new_organization`).
//! Its routing key is `<tenant>.<subject>.<action>` and its task name is
//! `<namespace>.tasks.<event name>`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DispatchError;

/// Subject abbreviation used for organization lifecycle events.
pub const ORG_SUBJECT: &str = "org";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Created,
    Updated,
    Deleted,
}

impl Action {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
        }
    }

    fn from_verb(verb: &str) -> Option<Self> {
        match verb {
            "new" | "create" => Some(Self::Created),
            "update" => Some(Self::Updated),
            "delete" => Some(Self::Deleted),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed `<verb>_<subject>` event name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventName {
    name: String,
    subject: String,
    action: Action,
}

impl EventName {
    /// # Errors
    /// Returns [`DispatchError::UnroutableEvent`] for an unknown verb or a
    /// subject that is empty or not `[a-z0-9_]`.
    pub fn parse(name: &str) -> Result<Self, DispatchError> {
        let unroutable = || DispatchError::UnroutableEvent {
            name: name.to_owned(),
        };
        let (verb, subject) = name.split_once('_').ok_or_else(unroutable)?;
        let action = Action::from_verb(verb).ok_or_else(unroutable)?;
        if subject.is_empty()
            || !subject
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(unroutable());
        }

        let subject = if subject == "organization" {
            ORG_SUBJECT
        } else {
            subject
        };
        Ok(Self {
            name: name.to_owned(),
            subject: subject.to_owned(),
            action,
        })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// Subject as it appears in routing keys (`organization` becomes `org`).
    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    #[must_use]
    pub fn action(&self) -> Action {
        self.action
    }

    #[must_use]
    pub fn routing_key(&self, tenant_slug: &str) -> String {
        routing_key(tenant_slug, &self.subject, self.action)
    }

    /// Topic pattern matching this event for every tenant.
    #[must_use]
    pub fn binding_pattern(&self) -> String {
        routing_key("*", &self.subject, self.action)
    }

    #[must_use]
    pub fn task_name(&self, namespace: &str) -> String {
        task_name(namespace, &self.name)
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[must_use]
pub fn routing_key(tenant_slug: &str, subject: &str, action: Action) -> String {
    format!("{tenant_slug}.{subject}.{action}")
}

#[must_use]
pub fn task_name(namespace: &str, event_name: &str) -> String {
    format!("{namespace}.tasks.{event_name}")
}

/// A tenant slug is one routing-key word: non-empty, without `.`, `*` or `#`.
///
/// # Errors
/// Returns [`DispatchError::InvalidTenant`] otherwise.
pub fn check_tenant_slug(slug: &str) -> Result<(), DispatchError> {
    let reason = if slug.is_empty() {
        Some("empty")
    } else if slug.contains(['.', '*', '#']) {
        Some("must not contain '.', '*' or '#'")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(DispatchError::InvalidTenant {
            slug: slug.to_owned(),
            reason: reason.to_owned(),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_space_routes_per_tenant() {
        let event = EventName::parse("update_space").unwrap();
        assert_eq!(event.subject(), "space");
        assert_eq!(event.action(), Action::Updated);
        assert_eq!(event.routing_key("acme"), "acme.space.updated");
        assert_eq!(event.binding_pattern(), "*.space.updated");
        assert_eq!(event.task_name("tenantbus"), "tenantbus.tasks.update_space");
    }

    #[test]
    fn organization_lifecycle_is_abbreviated() {
        let created = EventName::parse("new_organization").unwrap();
        assert_eq!(created.routing_key("acme"), "acme.org.created");
        let deleted = EventName::parse("delete_organization").unwrap();
        assert_eq!(deleted.routing_key("acme"), "acme.org.deleted");
        assert_eq!(deleted.as_str(), "delete_organization");
    }

    #[test]
    fn multi_word_subjects_are_kept() {
        let event = EventName::parse("create_organization_role").unwrap();
        assert_eq!(event.routing_key("acme"), "acme.organization_role.created");
    }

    #[test]
    fn unroutable_names_are_rejected() {
        for name in ["space", "rename_space", "update_", "update_Space", "update_a.b"] {
            assert!(
                matches!(
                    EventName::parse(name),
                    Err(DispatchError::UnroutableEvent { .. })
                ),
                "{name} should be rejected"
            );
        }
    }

    #[test]
    fn tenant_slug_must_be_one_word() {
        check_tenant_slug("acme-co").unwrap();
        assert!(check_tenant_slug("").is_err());
        assert!(check_tenant_slug("acme.co").is_err());
        assert!(check_tenant_slug("*").is_err());
    }
}
