//! Named, non-aggregated webhook embeds for login/logout events driven by
//! the control endpoint (and UDP session leave events once an identity has
//! been attached). Distinct from [`super::Aggregator`], which debounces
//! anonymous connect/disconnect bursts.

use super::webhook::{Embed, EmbedField};

const COLOR_JOIN: u32 = 0x2ECC71;
const COLOR_LEAVE: u32 = 0xE74C3C;

fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// A player joined and correlated to a known `(ip, protocol)` with the
/// ports observed while their login was pending.
pub fn join_embed(user: &str, ip: &str, protocol: &str, ports: &[u16]) -> Embed {
    let port_list = ports
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    Embed {
        title: Some(format!("{user} joined")),
        description: Some(format!("{ip} via {protocol}")),
        color: Some(COLOR_JOIN),
        timestamp: Some(now_iso()),
        fields: vec![EmbedField {
            name: "Ports".into(),
            value: port_list,
            inline: true,
        }],
        footer: None,
    }
}

/// A player logged in with no pending flow to correlate against.
pub fn generic_login_embed(user: &str) -> Embed {
    Embed {
        title: Some(format!("{user} logged in")),
        description: None,
        color: Some(COLOR_JOIN),
        timestamp: Some(now_iso()),
        fields: Vec::new(),
        footer: None,
    }
}

/// A player logged out and had a known last-seen `(ip, protocol)`.
pub fn leave_embed(user: &str, ip: &str, protocol: &str) -> Embed {
    Embed {
        title: Some(format!("{user} left")),
        description: Some(format!("{ip} via {protocol}")),
        color: Some(COLOR_LEAVE),
        timestamp: Some(now_iso()),
        fields: Vec::new(),
        footer: None,
    }
}

/// A player logged out with no known last-seen IP.
pub fn leave_embed_no_ip(user: &str) -> Embed {
    Embed {
        title: Some(format!("{user} left")),
        description: None,
        color: Some(COLOR_LEAVE),
        timestamp: Some(now_iso()),
        fields: Vec::new(),
        footer: None,
    }
}
