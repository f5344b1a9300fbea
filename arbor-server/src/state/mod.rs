//! Process-wide network state: the server tree, the user table, the
//! channel table and the X-line registry, all mutated under one lock
//! from the dispatch path.

pub mod channel;
pub mod user;
pub mod xline;

use arbor_proto::{Sid, Uid, UidGenerator};

use crate::tree::{ServerHandle, Tree};
use channel::ChanMap;
use user::{User, UserMap};
use xline::XLineManager;

#[derive(Debug)]
pub struct Network {
    pub tree: Tree,
    pub users: UserMap,
    pub chans: ChanMap,
    pub xlines: XLineManager,
    pub uid_gen: UidGenerator,
}

impl Network {
    pub fn new(name: &str, sid: Sid, description: &str) -> Self {
        Self {
            tree: Tree::new(name, sid, description),
            users: UserMap::default(),
            chans: ChanMap::default(),
            xlines: XLineManager::default(),
            uid_gen: UidGenerator::new(sid),
        }
    }

    /// Our own SID.
    pub fn sid(&self) -> Sid {
        self.tree
            .get(self.tree.root())
            .map(|n| n.sid)
            .expect("root exists")
    }

    /// Resolves a routing target — server name, SID, nickname or
    /// UUID — to the server that should receive it.
    pub fn find_route_target(&self, target: &str) -> Option<ServerHandle> {
        if let Ok(sid) = target.parse::<Sid>() {
            if let Some(handle) = self.tree.find_by_sid(sid) {
                return Some(handle);
            }
        }
        if let Ok(uid) = target.parse::<Uid>() {
            if let Some(user) = self.users.find_by_uuid(&uid) {
                return self.tree.find_by_sid(user.server());
            }
        }
        if let Some(handle) = self.tree.find_by_name(target) {
            return Some(handle);
        }
        self.users
            .find_by_nick(target)
            .and_then(|u| self.tree.find_by_sid(u.server()))
    }

    /// Introduces a user on our own server, for the layers above the
    /// S2S core (client registration, services shims, tests).
    pub fn add_local_user(&mut self, nick: &str, ident: &str, host: &str, ip: &str, ts: u64) -> Uid {
        let uid = self.uid_gen.next_uid();
        let user = User {
            uid: uid.clone(),
            nick: nick.to_string(),
            nick_ts: ts,
            ident: ident.to_string(),
            host: host.to_string(),
            dhost: host.to_string(),
            ip: ip.to_string(),
            signon: ts,
            modes: "i".to_string(),
            realname: nick.to_string(),
            oper: None,
            away: None,
            metadata: std::collections::HashMap::new(),
        };
        self.users.insert(user);
        if let Some(root) = self.tree.get_mut(self.tree.root()) {
            root.user_count += 1;
        }
        uid
    }

    /// Removes one user everywhere: user table plus channel rosters.
    pub fn quit_user(&mut self, uid: &Uid) -> Option<User> {
        let user = self.users.remove(uid)?;
        self.chans.quit_user(uid);
        if let Some(handle) = self.tree.find_by_sid(user.server()) {
            if let Some(node) = self.tree.get_mut(handle) {
                node.user_count = node.user_count.saturating_sub(1);
                if user.is_oper() {
                    node.oper_count = node.oper_count.saturating_sub(1);
                }
            }
        }
        Some(user)
    }

    /// Quits every user whose server is dead or gone. One pass over
    /// the user table; returns the quit users.
    pub fn quit_users_on_dead_servers(&mut self, reason: &str) -> Vec<User> {
        let dead: Vec<Uid> = self
            .users
            .iter()
            .filter(|u| {
                self.tree
                    .find_by_sid(u.server())
                    .and_then(|h| self.tree.get_live(h))
                    .is_none()
            })
            .map(|u| u.uid.clone())
            .collect();
        let mut quit = Vec::new();
        for uid in dead {
            if let Some(user) = self.users.remove(&uid) {
                self.chans.quit_user(&uid);
                tracing::debug!(uid = %uid, nick = %user.nick, reason, "user lost in split");
                quit.push(user);
            }
        }
        quit
    }
}
