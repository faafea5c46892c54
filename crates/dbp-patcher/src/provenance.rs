use std::{fs, io, path::Path};

pub const PROVENANCE_FILE: &str = "provenance.txt";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Provenance {
    pub version: String,
    pub archive_name: String,
    pub sha256: String,
    pub archive_size_bytes: u64,
    pub installed_at_unix_millis: i64,
}

pub fn write_provenance(dir: &Path, prov: &Provenance) -> io::Result<()> {
    let mut contents = format!(
        "version={}\narchive_name={}\nsha256={}\ninstalled_at_unix_millis={}\n",
        prov.version, prov.archive_name, prov.sha256, prov.installed_at_unix_millis
    );
    if prov.archive_size_bytes > 0 {
        contents.push_str(&format!(
            "archive_size_bytes={}\n",
            prov.archive_size_bytes
        ));
    }
    fs::write(dir.join(PROVENANCE_FILE), contents)
}

pub fn read_provenance(dir: &Path) -> io::Result<Provenance> {
    let contents = fs::read_to_string(dir.join(PROVENANCE_FILE))?;
    Ok(parse_provenance(&contents))
}

fn parse_provenance(contents: &str) -> Provenance {
    let mut prov = Provenance::default();
    for line in contents.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "version" => prov.version = value.to_string(),
            "archive_name" => prov.archive_name = value.to_string(),
            "sha256" => prov.sha256 = value.to_string(),
            "archive_size_bytes" => {
                if let Ok(parsed) = value.parse::<u64>() {
                    prov.archive_size_bytes = parsed;
                }
            }
            "installed_at_unix_millis" => {
                if let Ok(parsed) = value.parse::<i64>() {
                    prov.installed_at_unix_millis = parsed;
                }
            }
            _ => {}
        }
    }
    prov
}
