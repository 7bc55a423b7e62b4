use regex::Regex;
use std::sync::OnceLock;

/// Patterns the editor server's stdout is scanned with, in precedence
/// order. The set is a compatibility contract across editor versions;
/// narrowing it breaks some of them.
const PORT_PATTERNS: [&str; 4] = [
    r"(?i)web ui available at.*:(\d+)",
    r"localhost:(\d+)",
    r"127\.0\.0\.1:(\d+)",
    r"0\.0\.0\.0:(\d+)",
];

fn patterns() -> &'static [Regex] {
    static COMPILED: OnceLock<Vec<Regex>> = OnceLock::new();
    COMPILED.get_or_init(|| {
        PORT_PATTERNS
            .iter()
            .map(|p| Regex::new(p).expect("port pattern compiles"))
            .collect()
    })
}

/// Extracts the announced TCP port from one line of editor-server stdout.
/// Returns the first pattern's capture; later patterns are only consulted
/// when earlier ones do not match the line.
pub fn scrape_port(line: &str) -> Option<u16> {
    for pattern in patterns() {
        if let Some(captures) = pattern.captures(line) {
            if let Ok(port) = captures[1].parse::<u16>() {
                return Some(port);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_web_ui_announcement() {
        assert_eq!(
            scrape_port("Web UI available at http://0.0.0.0:45137"),
            Some(45137)
        );
        assert_eq!(
            scrape_port("WEB UI AVAILABLE AT http://localhost:8000"),
            Some(8000)
        );
    }

    #[test]
    fn matches_plain_address_forms() {
        assert_eq!(scrape_port("listening on localhost:51212"), Some(51212));
        assert_eq!(scrape_port("bound to 127.0.0.1:3000"), Some(3000));
        assert_eq!(scrape_port("serving at 0.0.0.0:8443"), Some(8443));
    }

    #[test]
    fn announcement_takes_precedence_over_address_forms() {
        let line = "localhost:9999 Web UI available at http://0.0.0.0:45137";
        assert_eq!(scrape_port(line), Some(45137));
    }

    #[test]
    fn ignores_lines_without_a_port() {
        assert_eq!(scrape_port("Server starting up..."), None);
        assert_eq!(scrape_port(""), None);
    }

    #[test]
    fn rejects_out_of_range_ports() {
        assert_eq!(scrape_port("localhost:99999"), None);
    }
}
