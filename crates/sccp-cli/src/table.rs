//! Plain-text rendering of the one CLI surface named in the session core:
//! a "list sessions" table. No ratatui/crossterm — this is a one-shot
//! dump, not an interactive view.

use std::time::{SystemTime, UNIX_EPOCH};

use sccp_core::SessionRegistry;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

const COLUMNS: [&str; 10] = [
    "Socket", "IP", "Port", "KA", "KAI", "DeviceName", "State", "Type", "RegState", "Token",
];

/// Renders every live session in `registry` as a fixed-width text table.
#[must_use]
pub fn render_session_table(registry: &SessionRegistry, keepalive_secs: u64) -> String {
    let now = now_secs();
    let mut rows: Vec<[String; 10]> = Vec::new();

    for session in registry.snapshot() {
        let device = session.device();
        let last_ka = session.last_keepalive();
        let ka_age = if last_ka == 0 { 0 } else { now.saturating_sub(last_ka) };

        let kai = device.as_ref().and_then(|d| d.keepalive_secs()).unwrap_or(keepalive_secs);

        rows.push([
            session.fd().to_string(),
            session.peer_addr().ip().to_string(),
            session.peer_addr().port().to_string(),
            ka_age.to_string(),
            kai.to_string(),
            device.as_ref().map_or_else(|| "-".to_owned(), |d| d.device_id().to_owned()),
            format!("{:?}", session.state()),
            "-".to_owned(),
            device.as_ref().map_or_else(|| "-".to_owned(), |d| format!("{:?}", d.registration_state())),
            "-".to_owned(),
        ]);
    }

    render(&rows)
}

fn render(rows: &[[String; 10]]) -> String {
    let mut widths: Vec<usize> = COLUMNS.iter().map(|c| c.len()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.len());
        }
    }

    let mut out = String::new();
    push_row(&mut out, &COLUMNS.map(str::to_owned), &widths);
    for row in rows {
        push_row(&mut out, row, &widths);
    }
    out
}

fn push_row(out: &mut String, cells: &[String; 10], widths: &[usize]) {
    for (i, cell) in cells.iter().enumerate() {
        out.push_str(&format!("{cell:<width$}  ", width = widths[i]));
    }
    out.push('\n');
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    use sccp_core::Session;

    use super::*;

    #[test]
    fn header_lists_all_ten_columns() {
        let registry = SessionRegistry::new();
        let table = render_session_table(&registry, 60);
        for column in COLUMNS {
            assert!(table.contains(column));
        }
    }

    #[test]
    fn one_row_per_session() {
        let registry = SessionRegistry::new();
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 2000);
        registry.insert(Session::new(7, addr, addr, 0));
        let table = render_session_table(&registry, 60);
        assert_eq!(table.lines().count(), 2);
    }
}
