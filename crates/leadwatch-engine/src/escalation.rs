use leadwatch_core::{Audience, LeadSnapshot, RecipientId, ReminderKind};
use leadwatch_storage::{LedgerStore, StorageError};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Recipients(Vec<RecipientId>),
    /// Nobody to deliver to. The reminder is dropped, not retried.
    Unroutable(String),
}

/// Chooses who hears about a reminder: the lead's seller or every admin.
#[derive(Debug, Clone, Default)]
pub struct EscalationRouter {
    static_admins: Vec<RecipientId>,
}

impl EscalationRouter {
    pub fn new(static_admins: Vec<RecipientId>) -> Self {
        Self { static_admins }
    }

    pub fn route(
        &self,
        store: &LedgerStore,
        kind: ReminderKind,
        lead: &LeadSnapshot,
    ) -> Result<Route, StorageError> {
        match kind.audience() {
            Audience::Seller => self.seller(store, lead),
            Audience::Admins => self.admin_route(store),
        }
    }

    pub fn seller(&self, store: &LedgerStore, lead: &LeadSnapshot) -> Result<Route, StorageError> {
        let Some(name) = lead.seller_name() else {
            return Ok(Route::Unroutable(format!("lead {} has no seller", lead.id)));
        };
        Ok(match store.find_seller_recipient(name)? {
            Some(recipient) => Route::Recipients(vec![recipient]),
            None => Route::Unroutable(format!("seller {name:?} is not registered")),
        })
    }

    /// Persisted admins plus the configured list, deduplicated.
    pub fn admins(&self, store: &LedgerStore) -> Result<Vec<RecipientId>, StorageError> {
        let mut admins = store.admin_recipients()?.into_iter().collect::<BTreeSet<_>>();
        admins.extend(self.static_admins.iter().copied());
        Ok(admins.into_iter().collect())
    }

    pub fn admin_route(&self, store: &LedgerStore) -> Result<Route, StorageError> {
        let admins = self.admins(store)?;
        Ok(if admins.is_empty() {
            Route::Unroutable("no administrators configured".to_string())
        } else {
            Route::Recipients(admins)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use leadwatch_storage::{RegisteredUser, UserRole};

    fn register(store: &LedgerStore, id: RecipientId, full_name: &str, role: UserRole) {
        let now = Utc
            .with_ymd_and_hms(2026, 3, 2, 9, 0, 0)
            .single()
            .expect("valid timestamp");
        store
            .upsert_user(&RegisteredUser {
                telegram_id: id,
                username: None,
                full_name: Some(full_name.to_string()),
                role,
                created_at: now,
                updated_at: now,
            })
            .expect("register user");
    }

    fn lead_for(seller: &str) -> LeadSnapshot {
        LeadSnapshot {
            seller: seller.to_string(),
            ..LeadSnapshot::new("L-1")
        }
    }

    #[test]
    fn seller_reminders_go_to_the_matched_seller() {
        let store = LedgerStore::open_in_memory().expect("open db");
        register(&store, 21, "Madina", UserRole::Seller);
        let router = EscalationRouter::new(vec![900]);

        let route = router
            .route(&store, ReminderKind::Call2Due, &lead_for(" madina "))
            .expect("route");
        assert_eq!(route, Route::Recipients(vec![21]));
    }

    #[test]
    fn unknown_or_missing_seller_is_unroutable() {
        let store = LedgerStore::open_in_memory().expect("open db");
        let router = EscalationRouter::default();

        assert!(matches!(
            router
                .route(&store, ReminderKind::Call1After1h, &lead_for("Ghost"))
                .expect("route"),
            Route::Unroutable(_)
        ));
        assert!(matches!(
            router
                .route(&store, ReminderKind::Call1After1h, &lead_for("  "))
                .expect("route"),
            Route::Unroutable(_)
        ));
    }

    #[test]
    fn escalation_goes_to_union_of_persisted_and_static_admins() {
        let store = LedgerStore::open_in_memory().expect("open db");
        register(&store, 3, "Root", UserRole::Admin);
        register(&store, 7, "Ops", UserRole::Admin);
        register(&store, 21, "Madina", UserRole::Seller);
        let router = EscalationRouter::new(vec![7, 100, 100]);

        let route = router
            .route(&store, ReminderKind::Call1Escalation, &lead_for("Madina"))
            .expect("route");
        assert_eq!(route, Route::Recipients(vec![3, 7, 100]));
    }

    #[test]
    fn escalation_without_admins_is_unroutable() {
        let store = LedgerStore::open_in_memory().expect("open db");
        let route = EscalationRouter::default()
            .route(&store, ReminderKind::Call1Escalation, &lead_for("Madina"))
            .expect("route");
        assert!(matches!(route, Route::Unroutable(_)));
    }
}
