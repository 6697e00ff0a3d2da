//! `mclaw skills` — manage the workspace skills directory.
//!
//! A skill is a directory containing a `SKILL.md` whose first body line is a
//! one-line description; installed skills are listed in the agent's context
//! block.

use clap::Subcommand;
use mclaw_config::Config;
use std::path::Path;

#[derive(Subcommand)]
pub enum SkillsAction {
    /// List installed skills
    List,

    /// Install a skill from a local directory
    Install {
        /// Path to a skill directory containing SKILL.md
        path: std::path::PathBuf,
    },

    /// Remove an installed skill by name
    Remove { name: String },
}

pub fn run(config_path: &Path, action: SkillsAction) -> Result<(), Box<dyn std::error::Error>> {
    let cfg = Config::load_from(config_path)?;
    let skills_dir = cfg.workspace_path().join("skills");

    match action {
        SkillsAction::List => {
            let Ok(entries) = std::fs::read_dir(&skills_dir) else {
                println!("No skills installed.");
                return Ok(());
            };
            let mut dirs: Vec<_> = entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_dir())
                .collect();
            dirs.sort();

            if dirs.is_empty() {
                println!("No skills installed.");
                return Ok(());
            }
            for dir in dirs {
                let name = dir.file_name().unwrap_or_default().to_string_lossy().into_owned();
                let description = std::fs::read_to_string(dir.join("SKILL.md"))
                    .ok()
                    .and_then(|content| {
                        content
                            .lines()
                            .map(str::trim)
                            .find(|l| !l.is_empty() && !l.starts_with('#'))
                            .map(String::from)
                    })
                    .unwrap_or_else(|| "(no description)".into());
                println!("{name}: {description}");
            }
        }

        SkillsAction::Install { path } => {
            if !path.join("SKILL.md").exists() {
                return Err(format!("{} has no SKILL.md", path.display()).into());
            }
            let name = path
                .file_name()
                .ok_or("skill path has no directory name")?
                .to_string_lossy()
                .into_owned();
            let target = skills_dir.join(&name);
            copy_dir(&path, &target)?;
            println!("Installed skill '{name}'");
        }

        SkillsAction::Remove { name } => {
            let target = skills_dir.join(&name);
            if target.is_dir() {
                std::fs::remove_dir_all(&target)?;
                println!("Removed skill '{name}'");
            } else {
                println!("Skill '{name}' not found");
            }
        }
    }

    Ok(())
}

fn copy_dir(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}
