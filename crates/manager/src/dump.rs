use std::io::Write;

/// Snapshot of both forwarding tables, sorted by target port.
///
/// `local` holds (peer target port, local listener port): traffic on the
/// local port goes out to the peer. `peer` holds (our target port, the port
/// the peer bound for it): traffic comes back in from the peer.
pub struct ForwardTables {
    pub local: Vec<(u16, u16)>,
    pub peer: Vec<(u16, u16)>,
}

fn render(tables: &ForwardTables) -> String {
    let mut entries: Vec<String> = tables
        .local
        .iter()
        .map(|(target, local)| format!("{local} ==> {target}"))
        .collect();
    entries.extend(
        tables
            .peer
            .iter()
            .map(|(target, peer)| format!("{target} <== {peer}")),
    );
    format!("Forwarding: [{}]", entries.join(", "))
}

/// Re-render the single forwarding summary line on stderr: blank the line
/// with a carriage return, then print e.g.
/// `Forwarding: [8080 ==> 8080, 9090 <== 9090]`.
pub fn dump_to_stderr(tables: &ForwardTables) {
    let mut stderr = std::io::stderr().lock();
    let _ = write!(stderr, "\r{:width$}\r", "", width = 100);
    let _ = write!(stderr, "{}", render(tables));
    let _ = stderr.flush();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_both_directions() {
        let tables = ForwardTables {
            local: vec![(80, 5080), (8080, 8080)],
            peer: vec![(9090, 9090)],
        };
        assert_eq!(
            render(&tables),
            "Forwarding: [5080 ==> 80, 8080 ==> 8080, 9090 <== 9090]"
        );
    }

    #[test]
    fn renders_empty_tables() {
        let tables = ForwardTables {
            local: vec![],
            peer: vec![],
        };
        assert_eq!(render(&tables), "Forwarding: []");
    }
}
