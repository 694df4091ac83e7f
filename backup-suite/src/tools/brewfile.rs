//! Brewfile and `mas list` parsing.
//!
//! A Brewfile (as written by `brew bundle dump`) has one directive per line:
//! `tap "user/repo"`, `brew "name"`, `cask "name"`, `mas "App", id: 123`,
//! plus directives this suite does not restore (`vscode`, `whalebrew`, ...).

/// What a Brewfile line installs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageKind {
    Tap,
    Formula,
    Cask,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub kind: PackageKind,
    pub name: String,
}

impl Package {
    /// Label used in restore results, e.g. `cask: firefox`.
    pub fn label(&self) -> String {
        let prefix = match self.kind {
            PackageKind::Tap => "tap",
            PackageKind::Formula => "brew",
            PackageKind::Cask => "cask",
        };
        format!("{}: {}", prefix, self.name)
    }
}

/// An app store application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreApp {
    pub id: String,
    pub name: String,
}

impl StoreApp {
    /// Brewfile form, `mas "Name", id: 123`.
    pub fn to_brewfile_line(&self) -> String {
        format!("mas \"{}\", id: {}", self.name, self.id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Brewfile {
    pub taps: Vec<Package>,
    pub formulae: Vec<Package>,
    pub casks: Vec<Package>,
    pub store_apps: Vec<StoreApp>,
}

impl Brewfile {
    pub fn parse(text: &str) -> Self {
        let mut brewfile = Brewfile::default();

        for line in text.lines().map(str::trim) {
            if let Some(app) = parse_mas_line(line) {
                brewfile.store_apps.push(app);
                continue;
            }

            let (kind, list) = if line.starts_with("tap ") {
                (PackageKind::Tap, &mut brewfile.taps)
            } else if line.starts_with("brew ") {
                (PackageKind::Formula, &mut brewfile.formulae)
            } else if line.starts_with("cask ") {
                (PackageKind::Cask, &mut brewfile.casks)
            } else {
                continue;
            };

            if let Some(name) = quoted(line) {
                list.push(Package {
                    kind,
                    name: name.to_string(),
                });
            }
        }

        brewfile
    }

    /// Packages that install something (taps excluded).
    pub fn package_count(&self) -> usize {
        self.formulae.len() + self.casks.len()
    }

    /// Raw Brewfile text with every `mas` line.
    pub fn store_app_lines(text: &str) -> Vec<String> {
        text.lines()
            .map(str::trim)
            .filter(|l| l.starts_with("mas "))
            .map(str::to_string)
            .collect()
    }
}

fn quoted(line: &str) -> Option<&str> {
    line.split('"').nth(1).filter(|s| !s.is_empty())
}

/// `mas "App Name", id: 123456`
pub fn parse_mas_line(line: &str) -> Option<StoreApp> {
    if !line.starts_with("mas ") {
        return None;
    }
    let name = quoted(line)?;
    let id = line.split("id:").nth(1)?.trim();
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(StoreApp {
        id: id.to_string(),
        name: name.to_string(),
    })
}

/// `mas list` output: `123456  App Name  (1.0)` per line.
pub fn parse_mas_list(text: &str) -> Vec<StoreApp> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim();
            let (id, rest) = line.split_once(char::is_whitespace)?;
            if !id.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            let name = rest.split('(').next().unwrap_or(rest).trim();
            Some(StoreApp {
                id: id.to_string(),
                name: name.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"tap "homebrew/bundle"
tap "oven-sh/bun"
brew "git"
brew "ripgrep", args: ["with-pcre2"]
cask "firefox"
cask "visual-studio-code"
mas "Xcode", id: 497799835
vscode "rust-lang.rust-analyzer"
"#;

    #[test]
    fn test_parse_brewfile() {
        let brewfile = Brewfile::parse(SAMPLE);
        assert_eq!(brewfile.taps.len(), 2);
        assert_eq!(brewfile.taps[1].name, "oven-sh/bun");
        assert_eq!(brewfile.formulae[1].name, "ripgrep");
        assert_eq!(brewfile.casks[0].label(), "cask: firefox");
        assert_eq!(brewfile.package_count(), 4);
        assert_eq!(
            brewfile.store_apps,
            vec![StoreApp {
                id: "497799835".to_string(),
                name: "Xcode".to_string()
            }]
        );
    }

    #[test]
    fn test_store_app_lines_roundtrip() {
        let lines = Brewfile::store_app_lines(SAMPLE);
        assert_eq!(lines, vec![r#"mas "Xcode", id: 497799835"#.to_string()]);
        let app = parse_mas_line(&lines[0]);
        assert_eq!(app.map(|a| a.to_brewfile_line()), Some(lines[0].clone()));
    }

    #[test]
    fn test_parse_mas_list() {
        let apps = parse_mas_list("497799835  Xcode  (15.4)\n409183694  Keynote (14.0)\nWarning: x\n");
        assert_eq!(apps.len(), 2);
        assert_eq!(apps[0].name, "Xcode");
        assert_eq!(apps[1].id, "409183694");
    }

    #[test]
    fn test_bad_mas_line() {
        assert!(parse_mas_line(r#"mas "Broken", id: abc"#).is_none());
        assert!(parse_mas_line(r#"brew "git""#).is_none());
    }
}
