use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::models::Role;

#[derive(Clone, Copy)]
struct CachedRole {
    role: Role,
    cached_at: Instant,
}

/// Time-boxed uid -> role memo so the guard does not hit the database on
/// every page load.
pub struct RoleCache {
    ttl: Duration,
    entries: Mutex<HashMap<Uuid, CachedRole>>,
}

impl RoleCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, uid: &Uuid) -> Option<Role> {
        self.get_at(uid, Instant::now())
    }

    fn get_at(&self, uid: &Uuid, now: Instant) -> Option<Role> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|_, v| now.saturating_duration_since(v.cached_at) <= self.ttl);
        entries.get(uid).map(|entry| entry.role)
    }

    pub fn insert(&self, uid: Uuid, role: Role) {
        self.insert_at(uid, role, Instant::now());
    }

    fn insert_at(&self, uid: Uuid, role: Role, now: Instant) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            uid,
            CachedRole {
                role,
                cached_at: now,
            },
        );
    }

    pub fn invalidate(&self, uid: &Uuid) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(uid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_cached_role_within_ttl() {
        let cache = RoleCache::new(Duration::from_secs(300));
        let uid = Uuid::new_v4();
        let start = Instant::now();
        cache.insert_at(uid, Role::Dosen, start);
        assert_eq!(
            cache.get_at(&uid, start + Duration::from_secs(299)),
            Some(Role::Dosen)
        );
    }

    #[test]
    fn expired_entries_are_pruned() {
        let cache = RoleCache::new(Duration::from_secs(300));
        let uid = Uuid::new_v4();
        let start = Instant::now();
        cache.insert_at(uid, Role::Admin, start);
        assert_eq!(cache.get_at(&uid, start + Duration::from_secs(301)), None);
        assert!(cache.entries.lock().unwrap().is_empty());
    }

    #[test]
    fn invalidate_drops_entry() {
        let cache = RoleCache::new(Duration::from_secs(300));
        let uid = Uuid::new_v4();
        cache.insert(uid, Role::Mahasiswa);
        cache.invalidate(&uid);
        assert_eq!(cache.get(&uid), None);
    }
}
