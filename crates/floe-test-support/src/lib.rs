pub mod fixtures {
    use std::fs;
    use std::io;
    use std::path::{Path, PathBuf};

    pub fn root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("..")
            .join("..")
            .join("tests")
            .join("fixtures")
    }

    pub fn path(relative: impl AsRef<Path>) -> PathBuf {
        root().join(relative.as_ref())
    }

    pub fn read(relative: impl AsRef<Path>) -> io::Result<String> {
        fs::read_to_string(path(relative))
    }

    pub fn stanza(name: &str) -> String {
        read_or_panic(Path::new("stanzas").join(name))
    }

    fn read_or_panic(relative: impl AsRef<Path>) -> String {
        let relative = relative.as_ref();
        read(relative).unwrap_or_else(|error| {
            panic!(
                "failed to read fixture {}: {error}",
                relative.to_string_lossy()
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures;

    #[test]
    fn fixture_root_exists() {
        assert!(fixtures::root().is_dir());
    }

    #[test]
    fn loads_stanza_fixture() {
        let stanza = fixtures::stanza("message-chat.xml");
        assert!(stanza.contains("<message"));
    }

    #[test]
    fn stanza_fixtures_are_well_formed_xml() {
        for name in [
            "message-chat.xml",
            "message-groupchat.xml",
            "presence-muc-self.xml",
            "presence-muc-conflict.xml",
            "iq-ping.xml",
        ] {
            let raw = fixtures::stanza(name);
            raw.trim()
                .parse::<minidom::Element>()
                .unwrap_or_else(|error| panic!("{name} should parse: {error}"));
        }
    }
}
