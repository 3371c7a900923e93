use std::fs;
use std::path::{Path, PathBuf};

use clap::{Args, Command};

const DEFAULT_OUT_DIR: &str = "dist/share/man/man1";

#[derive(Args, Debug)]
pub struct ManArgs {
    /// Output directory
    #[arg(long = "out-dir", default_value = DEFAULT_OUT_DIR)]
    pub out_dir: PathBuf,
}

impl Default for ManArgs {
    fn default() -> Self {
        Self {
            out_dir: PathBuf::from(DEFAULT_OUT_DIR),
        }
    }
}

pub fn cmd_man(args: ManArgs) -> Result<(), String> {
    let out_dir = crate::workspace_root().join(args.out_dir);
    fs::create_dir_all(&out_dir).map_err(|e| format!("{}: {e}", out_dir.display()))?;

    let cmd = cfrelease::command();
    let bin_name = cmd.get_name().to_string();
    write_page(&out_dir, &bin_name, cmd.clone())?;

    // One page per subcommand: cfrelease-release.1, cfrelease-step.1, ...
    for subcommand in cmd.get_subcommands() {
        let page = format!("{bin_name}-{}", subcommand.get_name());
        write_page(&out_dir, &page, subcommand.clone())?;
    }

    Ok(())
}

fn write_page(out_dir: &Path, page: &str, cmd: Command) -> Result<(), String> {
    let mut buffer: Vec<u8> = Vec::new();
    clap_mangen::Man::new(cmd)
        .render(&mut buffer)
        .map_err(|e| format!("render manpage for {page}: {e}"))?;

    let man_path = out_dir.join(format!("{page}.1"));
    fs::write(&man_path, buffer).map_err(|e| format!("{}: {e}", man_path.display()))?;
    println!("wrote {}", man_path.display());
    Ok(())
}
