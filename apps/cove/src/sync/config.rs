//! Renders the sync agent's configuration file. The agent re-reads it on
//! restart, which is how the folder direction flips from send-only to
//! bidirectional.

use std::path::Path;

use super::FolderMode;

pub struct SyncConfig<'a> {
    pub folder_id: &'a str,
    pub source: &'a Path,
    pub mode: FolderMode,
    pub local_device: &'a str,
    pub remote_device: &'a str,
    pub listen_port: u16,
    pub remote_port: u16,
    pub gui_port: u16,
    pub api_key: &'a str,
}

pub fn render(config: &SyncConfig<'_>) -> String {
    format!(
        r#"<configuration version="37">
    <folder id="{folder}" label="{folder}" path="{source}" type="{mode}" rescanIntervalS="300" fsWatcherEnabled="true" ignorePerms="false">
        <device id="{local}"></device>
        <device id="{remote}"></device>
    </folder>
    <device id="{local}" name="local">
        <address>tcp://127.0.0.1:{listen}</address>
    </device>
    <device id="{remote}" name="remote">
        <address>tcp://127.0.0.1:{remote_port}</address>
    </device>
    <gui enabled="true" tls="false">
        <address>127.0.0.1:{gui}</address>
        <apikey>{api_key}</apikey>
    </gui>
    <options>
        <globalAnnounceEnabled>false</globalAnnounceEnabled>
        <localAnnounceEnabled>false</localAnnounceEnabled>
        <relaysEnabled>false</relaysEnabled>
        <natEnabled>false</natEnabled>
        <urAccepted>-1</urAccepted>
        <startBrowser>false</startBrowser>
    </options>
</configuration>
"#,
        folder = config.folder_id,
        source = config.source.display(),
        mode = config.mode.as_config(),
        local = config.local_device,
        remote = config.remote_device,
        listen = config.listen_port,
        remote_port = config.remote_port,
        gui = config.gui_port,
        api_key = config.api_key,
    )
}

#[cfg(test)]
mod tests {
    use super::super::device;
    use super::*;
    use std::path::PathBuf;

    fn config(mode: FolderMode) -> String {
        let source = PathBuf::from("/work/project");
        render(&SyncConfig {
            folder_id: "cove-web",
            source: &source,
            mode,
            local_device: &device::local_device_id(),
            remote_device: &device::remote_device_id(),
            listen_port: 41001,
            remote_port: 41002,
            gui_port: 41003,
            api_key: "secret",
        })
    }

    /// Every `device id` attribute in the rendered file, in document order.
    fn device_ids(rendered: &str) -> Vec<String> {
        rendered
            .match_indices("device id=\"")
            .map(|(start, token)| {
                let value = &rendered[start + token.len()..];
                let end = value.find('"').expect("closing quote");
                value[..end].to_string()
            })
            .collect()
    }

    #[test]
    fn send_only_is_the_initial_direction() {
        let rendered = config(FolderMode::SendOnly);
        assert!(rendered.contains(r#"type="sendonly""#));
        assert!(rendered.contains("cove-web"));
        assert!(rendered.contains("41003"));
        assert!(rendered.contains("<apikey>secret</apikey>"));
    }

    #[test]
    fn direction_flips_to_send_receive() {
        let rendered = config(FolderMode::SendReceive);
        assert!(rendered.contains(r#"type="sendreceive""#));
    }

    #[test]
    fn every_rendered_device_id_passes_the_engine_format() {
        let rendered = config(FolderMode::SendOnly);
        let ids = device_ids(&rendered);
        assert_eq!(ids.len(), 4, "two folder members plus two device blocks");
        for id in &ids {
            assert!(device::is_valid(id), "engine would reject device id {id}");
        }
        assert!(ids.contains(&device::local_device_id()));
        assert!(ids.contains(&device::remote_device_id()));
    }
}
