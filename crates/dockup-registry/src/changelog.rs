//! Release-notes URL lookup.

/// Well-known images and where their releases are published. `{repo}` is
/// replaced with the last path segment of the image.
const KNOWN_CHANGELOGS: &[(&str, &str)] = &[
    ("lscr.io/linuxserver", "https://github.com/linuxserver/{repo}/releases"),
    ("linuxserver/", "https://github.com/linuxserver/{repo}/releases"),
    ("ghcr.io/immich-app", "https://github.com/immich-app/immich/releases"),
    ("ghcr.io/gethomepage", "https://github.com/gethomepage/homepage/releases"),
    ("ghcr.io/flaresolverr", "https://github.com/FlareSolverr/FlareSolverr/releases"),
    ("ghcr.io/advplyr", "https://github.com/advplyr/audiobookshelf/releases"),
    ("adguard/adguardhome", "https://github.com/AdguardTeam/AdGuardHome/releases"),
    ("binwiederhier/ntfy", "https://github.com/binwiederhier/ntfy/releases"),
    ("plexinc/pms-docker", "https://forums.plex.tv/t/plex-media-server/30447"),
    ("qbittorrentofficial", "https://github.com/qbittorrent/qBittorrent/releases"),
    ("jellyfin/jellyfin", "https://github.com/jellyfin/jellyfin/releases"),
    ("portainer/portainer", "https://github.com/portainer/portainer/releases"),
];

/// Resolves a changelog URL: label override, then configured fragments,
/// then the built-in table.
#[derive(Debug, Clone, Default)]
pub struct ChangelogResolver {
    /// `(image fragment, url)` pairs from configuration, in order.
    overrides: Vec<(String, String)>,
}

impl ChangelogResolver {
    pub fn new(overrides: Vec<(String, String)>) -> Self {
        Self { overrides }
    }

    pub fn resolve(&self, image: &str, label_override: Option<&str>) -> Option<String> {
        if let Some(url) = label_override.filter(|u| !u.trim().is_empty()) {
            return Some(url.trim().to_string());
        }

        let image_lower = image.to_ascii_lowercase();
        if let Some((_, url)) = self
            .overrides
            .iter()
            .find(|(frag, _)| image_lower.contains(&frag.to_ascii_lowercase()))
        {
            return Some(url.clone());
        }

        let (path, _, _) = crate::reference::split_reference(image);
        let repo = path.rsplit('/').next().unwrap_or(path);
        KNOWN_CHANGELOGS
            .iter()
            .find(|(pattern, _)| image_lower.contains(pattern))
            .map(|(_, template)| template.replace("{repo}", repo))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_wins() {
        let resolver = ChangelogResolver::new(vec![("radarr".into(), "https://cfg".into())]);
        assert_eq!(
            resolver
                .resolve("lscr.io/linuxserver/radarr", Some("https://label"))
                .as_deref(),
            Some("https://label")
        );
    }

    #[test]
    fn configured_fragment_before_builtin() {
        let resolver = ChangelogResolver::new(vec![("Radarr".into(), "https://cfg".into())]);
        assert_eq!(
            resolver.resolve("lscr.io/linuxserver/radarr:5.2", None).as_deref(),
            Some("https://cfg")
        );
    }

    #[test]
    fn builtin_table_substitutes_repo() {
        let resolver = ChangelogResolver::default();
        assert_eq!(
            resolver.resolve("lscr.io/linuxserver/sonarr:4.0.1", None).as_deref(),
            Some("https://github.com/linuxserver/sonarr/releases")
        );
        assert_eq!(
            resolver.resolve("jellyfin/jellyfin", None).as_deref(),
            Some("https://github.com/jellyfin/jellyfin/releases")
        );
        assert_eq!(resolver.resolve("nginx:1.25", None), None);
    }
}
