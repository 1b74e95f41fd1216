//! Maps ports and banners to service names.

/// Well known ports paired with their conventional service name.
pub const COMMON_SERVICES: &[(u16, &str)] = &[
    (7, "echo"),
    (20, "ftp-data"),
    (21, "ftp"),
    (22, "ssh"),
    (23, "telnet"),
    (25, "smtp"),
    (43, "whois"),
    (53, "dns"),
    (67, "dhcp"),
    (68, "dhcp"),
    (69, "tftp"),
    (80, "http"),
    (110, "pop3"),
    (115, "sftp"),
    (119, "nntp"),
    (123, "ntp"),
    (137, "netbios-ns"),
    (138, "netbios-dgm"),
    (139, "netbios-ssn"),
    (143, "imap"),
    (161, "snmp"),
    (179, "bgp"),
    (194, "irc"),
    (389, "ldap"),
    (443, "https"),
    (445, "smb"),
    (514, "syslog"),
    (515, "printer"),
    (587, "smtps"),
    (631, "ipp"),
    (636, "ldaps"),
    (993, "imaps"),
    (995, "pop3s"),
    (1080, "socks"),
    (1194, "openvpn"),
    (1433, "mssql"),
    (1723, "pptp"),
    (1900, "upnp"),
    (2082, "cpanel"),
    (2083, "cpanel-ssl"),
    (2086, "whm"),
    (2087, "whm-ssl"),
    (2095, "webmail"),
    (2096, "webmail-ssl"),
    (2181, "zookeeper"),
    (2375, "docker"),
    (2376, "docker-ssl"),
    (2483, "oracle"),
    (2484, "oracle-ssl"),
    (3000, "nodejs"),
    (3306, "mysql"),
    (3389, "rdp"),
    (5432, "postgresql"),
    (5500, "vnc"),
    (5601, "kibana"),
    (5672, "amqp"),
    (5900, "vnc"),
    (5938, "teamviewer"),
    (6379, "redis"),
    (6443, "kubernetes"),
    (6666, "irc"),
    (6667, "irc"),
    (8000, "http-alt"),
    (8008, "http-alt"),
    (8080, "http-proxy"),
    (8081, "http-alt"),
    (8443, "https-alt"),
    (8888, "http-alt"),
    (9000, "php-fpm"),
    (9042, "cassandra"),
    (9092, "kafka"),
    (9200, "elasticsearch"),
    (9300, "elasticsearch"),
    (11211, "memcached"),
    (27017, "mongodb"),
    (27018, "mongodb"),
    (50000, "db2"),
];

/// Ports from [`COMMON_SERVICES`], ascending and deduplicated.
pub fn common_ports() -> Vec<u16> {
    let mut ports: Vec<u16> = COMMON_SERVICES.iter().map(|&(port, _)| port).collect();
    ports.sort_unstable();
    ports.dedup();
    ports
}

/// Name for a port, refined by the banner when one was grabbed.
pub fn service_name(port: u16, banner: Option<&str>) -> String {
    let by_port = COMMON_SERVICES
        .iter()
        .find(|&&(p, _)| p == port)
        .map_or("unknown", |&(_, name)| name);

    let Some(banner) = banner.map(str::to_lowercase) else {
        return by_port.to_owned();
    };

    let refined = if banner.contains("ssh") {
        "ssh"
    } else if banner.contains("http") {
        if port == 443 {
            "https"
        } else {
            "http"
        }
    } else if banner.contains("smtp") {
        "smtp"
    } else if banner.contains("ftp") {
        "ftp"
    } else if banner.contains("mysql") {
        "mysql"
    } else {
        by_port
    };

    refined.to_owned()
}

/// Whether the port usually speaks HTTP and needs a request before it answers.
pub fn expects_http_request(port: u16) -> bool {
    matches!(
        port,
        80 | 443 | 3000 | 5601 | 8000 | 8008 | 8080 | 8081 | 8443 | 8888 | 9200
    )
}
