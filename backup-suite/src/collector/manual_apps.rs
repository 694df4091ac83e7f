//! Applications installed by hand.
//!
//! An app in the applications directory counts as "manual" when neither the
//! package manager (as a cask) nor the app store installed it. Names only
//! loosely match across the three sources, so the comparison is fuzzy.

use std::fs;
use std::path::Path;

/// App bundle names (without `.app`) directly inside `dir`, sorted.
pub fn installed_app_names(dir: &Path) -> std::io::Result<Vec<String>> {
    let mut names: Vec<String> = fs::read_dir(dir)?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "app"))
        .filter_map(|p| p.file_stem().map(|s| s.to_string_lossy().to_string()))
        .collect();
    names.sort_by_key(|n| n.to_lowercase());
    Ok(names)
}

/// Apps matched by neither a cask token nor an app store name.
pub fn find_manual_apps(apps: &[String], casks: &[String], store_apps: &[String]) -> Vec<String> {
    let casks: Vec<String> = normalized(casks);
    let store_apps: Vec<String> = normalized(store_apps);

    apps.iter()
        .filter(|app| {
            let app = app.to_lowercase();
            !casks.iter().any(|c| matches_cask(&app, c))
                && !store_apps.iter().any(|m| matches_store_app(&app, m))
        })
        .cloned()
        .collect()
}

fn normalized(names: &[String]) -> Vec<String> {
    names
        .iter()
        .map(|n| n.trim().to_lowercase())
        .filter(|n| !n.is_empty())
        .collect()
}

/// "Visual Studio Code" vs `visual-studio-code`, "Firefox" vs `firefox@nightly`
fn matches_cask(app: &str, cask: &str) -> bool {
    app.contains(cask)
        || cask.contains(app)
        || app.replace(' ', "-") == cask
        || app.replace(' ', "") == cask.replace('-', "")
}

fn matches_store_app(app: &str, store_app: &str) -> bool {
    app == store_app || app.contains(store_app) || store_app.contains(app)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_fuzzy_matching() {
        let apps = strings(&[
            "Visual Studio Code",
            "Firefox",
            "Keynote",
            "Affinity Photo 2",
            "Some Vendor Tool",
        ]);
        let casks = strings(&["visual-studio-code", "firefox", ""]);
        let store = strings(&["Keynote", "Affinity Photo"]);

        assert_eq!(find_manual_apps(&apps, &casks, &store), strings(&["Some Vendor Tool"]));
    }

    #[test]
    fn test_joined_cask_names() {
        let apps = strings(&["Google Chrome", "Docker Desktop"]);
        let casks = strings(&["googlechrome"]);
        assert_eq!(find_manual_apps(&apps, &casks, &[]), strings(&["Docker Desktop"]));
    }

    #[test]
    fn test_installed_app_names() -> std::io::Result<()> {
        let temp = TempDir::new()?;
        fs::create_dir(temp.path().join("Zed.app"))?;
        fs::create_dir(temp.path().join("arc.app"))?;
        fs::create_dir(temp.path().join("Utilities"))?;
        fs::write(temp.path().join("readme.txt"), b"")?;

        assert_eq!(installed_app_names(temp.path())?, strings(&["arc", "Zed"]));
        Ok(())
    }
}
