//! systemd unit file generation for `baihu-agent install`.

/// Print a systemd unit file for running this agent as a service.
pub fn generate(user: &str, working_dir: Option<&str>, config_path: &str) {
    let exe_path = std::env::current_exe()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| "/usr/local/bin/baihu-agent".to_string());

    let resolved_working_dir = working_dir.map(String::from).unwrap_or_else(|| {
        std::env::current_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| "/opt/baihu-agent".to_string())
    });

    println!(
        "\
[Unit]
Description=baihu remote worker agent
After=network-online.target
Wants=network-online.target

[Service]
Type=simple
User={user}
WorkingDirectory={working_dir}
ExecStart={exe_path} -c {config_path} run
Restart=on-failure
RestartSec=5

StandardOutput=journal
StandardError=journal
SyslogIdentifier=baihu-agent

NoNewPrivileges=true
ProtectSystem=strict
ProtectHome=read-only
ReadWritePaths={working_dir}
PrivateTmp=true

[Install]
WantedBy=multi-user.target",
        user = user,
        working_dir = resolved_working_dir,
        exe_path = exe_path,
        config_path = config_path,
    );
}

#[cfg(test)]
mod tests {
    #[test]
    fn generate_produces_expected_sections() {
        let output = format!(
            "\
[Unit]
Description=baihu remote worker agent
After=network-online.target
Wants=network-online.target

[Service]
Type=simple
User={user}
WorkingDirectory={working_dir}
ExecStart={exe_path} -c {config_path} run
Restart=on-failure
RestartSec=5

StandardOutput=journal
StandardError=journal
SyslogIdentifier=baihu-agent

NoNewPrivileges=true
ProtectSystem=strict
ProtectHome=read-only
ReadWritePaths={working_dir}
PrivateTmp=true

[Install]
WantedBy=multi-user.target",
            user = "baihu-test",
            working_dir = "/opt/baihu-agent",
            exe_path = "/usr/local/bin/baihu-agent",
            config_path = "config.ini",
        );

        assert!(output.contains("[Unit]"));
        assert!(output.contains("User=baihu-test"));
        assert!(output.contains("ExecStart=/usr/local/bin/baihu-agent -c config.ini run"));
        assert!(output.contains("WantedBy=multi-user.target"));
    }
}
