//! Service name lookup for name-based connects.
//!
//! `WSAConnectByName` accepts either a port number or a service name from the
//! system services database. Only well-known TCP services are listed; a name
//! not found here makes the call non-redirectable.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::endpoint::{ip_endpoint, parse_ip_literal, Endpoint};

static SERVICES: Lazy<HashMap<&'static str, u16>> = Lazy::new(|| {
    [
        ("echo", 7),
        ("discard", 9),
        ("daytime", 13),
        ("qotd", 17),
        ("chargen", 19),
        ("ftp-data", 20),
        ("ftp", 21),
        ("ssh", 22),
        ("telnet", 23),
        ("smtp", 25),
        ("time", 37),
        ("nameserver", 42),
        ("nicname", 43),
        ("whois", 43),
        ("domain", 53),
        ("gopher", 70),
        ("finger", 79),
        ("http", 80),
        ("www", 80),
        ("www-http", 80),
        ("kerberos", 88),
        ("hostname", 101),
        ("iso-tsap", 102),
        ("rtelnet", 107),
        ("pop2", 109),
        ("pop3", 110),
        ("sunrpc", 111),
        ("auth", 113),
        ("uucp-path", 117),
        ("nntp", 119),
        ("ntp", 123),
        ("epmap", 135),
        ("netbios-ns", 137),
        ("netbios-ssn", 139),
        ("imap", 143),
        ("pcmail-srv", 158),
        ("snmp", 161),
        ("print-srv", 170),
        ("bgp", 179),
        ("irc", 194),
        ("ipx", 213),
        ("ldap", 389),
        ("https", 443),
        ("mcom", 443),
        ("microsoft-ds", 445),
        ("kpasswd", 464),
        ("exec", 512),
        ("login", 513),
        ("cmd", 514),
        ("printer", 515),
        ("efs", 520),
        ("tempo", 526),
        ("courier", 530),
        ("conference", 531),
        ("netnews", 532),
        ("uucp", 540),
        ("klogin", 543),
        ("kshell", 544),
        ("submission", 587),
        ("http-rpc-epmap", 593),
        ("ldaps", 636),
        ("rsync", 873),
        ("ftps-data", 989),
        ("ftps", 990),
        ("telnets", 992),
        ("imaps", 993),
        ("pop3s", 995),
        ("socks", 1080),
        ("kpop", 1109),
        ("ms-sql-s", 1433),
        ("ms-sql-m", 1434),
        ("wins", 1512),
        ("ingreslock", 1524),
        ("l2tp", 1701),
        ("pptp", 1723),
        ("radius", 1812),
        ("radacct", 1813),
        ("nfsd", 2049),
        ("knetd", 2053),
        ("mysql", 3306),
        ("ms-wbt-server", 3389),
        ("postgresql", 5432),
        ("http-alt", 8080),
    ]
    .into_iter()
    .collect()
});

/// Port of a well-known service name, case-insensitive.
pub fn service_port(name: &str) -> Option<u16> {
    SERVICES.get(name.to_ascii_lowercase().as_str()).copied()
}

/// Turn a `(node, service)` pair into an endpoint.
///
/// Numeric services parse directly, symbolic ones go through the service
/// table. Literal IPs become IP endpoints; any other node name is kept as a
/// domain for the proxy to resolve.
pub fn resolve_name(node: &str, service: &str) -> Option<Endpoint> {
    if node.is_empty() || service.is_empty() {
        return None;
    }

    let port = if service.bytes().all(|c| c.is_ascii_digit()) {
        service.parse::<u16>().ok()?
    } else {
        service_port(service)?
    };

    match parse_ip_literal(node) {
        Some(ip) => Some(ip_endpoint(ip, port)),
        None => Some(Endpoint::domain(node, port)),
    }
}
