//! The user table: every user on the network, local or remote,
//! dual-indexed by UUID and (case-insensitively) by nickname.

use std::collections::HashMap;

use arbor_proto::{Sid, Uid};

/// One user, as the S2S layer sees them.
#[derive(Debug, Clone)]
pub struct User {
    pub uid: Uid,
    pub nick: String,
    /// Nickname timestamp. Conflict resolution hinges on this.
    pub nick_ts: u64,
    pub ident: String,
    pub host: String,
    pub dhost: String,
    pub ip: String,
    /// Connection timestamp.
    pub signon: u64,
    /// User mode letters, sorted.
    pub modes: String,
    pub realname: String,
    /// Oper type name plus the effective grant set, if opered.
    pub oper: Option<OperInfo>,
    /// Away time and message, if away.
    pub away: Option<(u64, String)>,
    /// Extensible metadata slots.
    pub metadata: HashMap<String, String>,
}

/// An oper grant set carried by OPERTYPE. Absent fields mean the
/// introducing peer predates granular privileges and gets everything.
#[derive(Debug, Clone, Default)]
pub struct OperInfo {
    pub name: String,
    pub chanmodes: Option<String>,
    pub usermodes: Option<String>,
    pub snomasks: Option<String>,
    pub commands: Option<String>,
    pub privileges: Option<String>,
}

impl User {
    /// The server this user lives on.
    pub fn server(&self) -> Sid {
        self.uid.sid()
    }

    pub fn is_oper(&self) -> bool {
        self.oper.is_some()
    }
}

/// Dual-indexed user registry.
#[derive(Debug, Default)]
pub struct UserMap {
    by_uid: HashMap<Uid, User>,
    /// lowercase nick -> uid
    by_nick: HashMap<String, Uid>,
}

impl UserMap {
    pub fn find_by_uuid(&self, uid: &Uid) -> Option<&User> {
        self.by_uid.get(uid)
    }

    pub fn find_by_uuid_mut(&mut self, uid: &Uid) -> Option<&mut User> {
        self.by_uid.get_mut(uid)
    }

    pub fn find_by_nick(&self, nick: &str) -> Option<&User> {
        self.by_nick
            .get(&nick.to_lowercase())
            .and_then(|uid| self.by_uid.get(uid))
    }

    /// Resolves a nick or UUID to a user.
    pub fn find(&self, target: &str) -> Option<&User> {
        if let Ok(uid) = target.parse::<Uid>() {
            return self.find_by_uuid(&uid);
        }
        self.find_by_nick(target)
    }

    /// Inserts a user. The caller has already resolved any nickname
    /// collision; a occupied nickname here is a programming error.
    pub fn insert(&mut self, user: User) {
        debug_assert!(!self.by_nick.contains_key(&user.nick.to_lowercase()));
        self.by_nick
            .insert(user.nick.to_lowercase(), user.uid.clone());
        self.by_uid.insert(user.uid.clone(), user);
    }

    /// Renames a user, keeping both indices consistent. Returns false
    /// if the user is unknown.
    pub fn rename(&mut self, uid: &Uid, new_nick: &str, new_ts: u64) -> bool {
        let Some(user) = self.by_uid.get_mut(uid) else {
            return false;
        };
        self.by_nick.remove(&user.nick.to_lowercase());
        user.nick = new_nick.to_string();
        user.nick_ts = new_ts;
        self.by_nick.insert(new_nick.to_lowercase(), uid.clone());
        true
    }

    /// Removes a user, returning them.
    pub fn remove(&mut self, uid: &Uid) -> Option<User> {
        let user = self.by_uid.remove(uid)?;
        // Only drop the nick index entry if it still points at us; a
        // collision may have handed the nick to someone else already.
        if self.by_nick.get(&user.nick.to_lowercase()) == Some(uid) {
            self.by_nick.remove(&user.nick.to_lowercase());
        }
        Some(user)
    }

    /// All users on a given server.
    pub fn on_server(&self, sid: Sid) -> Vec<Uid> {
        self.by_uid
            .values()
            .filter(|u| u.server() == sid)
            .map(|u| u.uid.clone())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &User> {
        self.by_uid.values()
    }

    pub fn len(&self) -> usize {
        self.by_uid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_uid.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(uid: &str, nick: &str, ts: u64) -> User {
        User {
            uid: uid.parse().unwrap(),
            nick: nick.to_string(),
            nick_ts: ts,
            ident: "ident".into(),
            host: "host.example".into(),
            dhost: "host.example".into(),
            ip: "10.0.0.1".into(),
            signon: ts,
            modes: "i".into(),
            realname: "Real Name".into(),
            oper: None,
            away: None,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn nick_lookup_is_case_insensitive() {
        let mut users = UserMap::default();
        users.insert(user("001AAAAAA", "Alice", 100));
        assert!(users.find_by_nick("alice").is_some());
        assert!(users.find_by_nick("ALICE").is_some());
        assert!(users.find("001AAAAAA").is_some());
    }

    #[test]
    fn rename_moves_the_nick_index() {
        let mut users = UserMap::default();
        users.insert(user("001AAAAAA", "Alice", 100));
        let uid: Uid = "001AAAAAA".parse().unwrap();
        assert!(users.rename(&uid, "Bob", 200));
        assert!(users.find_by_nick("alice").is_none());
        assert_eq!(users.find_by_nick("bob").unwrap().nick_ts, 200);
    }

    #[test]
    fn remove_does_not_clobber_a_reassigned_nick() {
        let mut users = UserMap::default();
        users.insert(user("001AAAAAA", "Alice", 100));
        let uid: Uid = "001AAAAAA".parse().unwrap();
        users.rename(&uid, "001AAAAAA", 100);
        users.insert(user("002AAAAAA", "Alice", 50));
        users.remove(&uid);
        assert!(users.find_by_nick("alice").is_some());
    }
}
