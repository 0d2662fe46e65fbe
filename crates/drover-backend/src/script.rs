//! Batch script rendering and the scheduler time formats.

use std::fmt::Write as _;
use std::time::Duration;

use drover_pool::JobRequest;

/// Walltime in the `HH:MM:SS` form both Slurm and PBS accept. Hours may
/// run past two digits.
pub(crate) fn format_walltime(walltime: Duration) -> String {
    let total = walltime.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

/// Elapsed time as squeue prints it: `[days-[hours:]]minutes:seconds`,
/// with leading fields omitted when zero.
pub(crate) fn parse_dhms(text: &str) -> Option<Duration> {
    let (days, clock) = match text.split_once('-') {
        Some((d, rest)) => (d.parse::<u64>().ok()?, rest),
        None => (0, text),
    };
    let fields: Vec<u64> = clock
        .split(':')
        .map(|f| f.parse::<u64>())
        .collect::<Result<_, _>>()
        .ok()?;
    let (hours, minutes, seconds) = match fields[..] {
        [m, s] => (0, m, s),
        [h, m, s] => (h, m, s),
        _ => return None,
    };
    Some(Duration::from_secs(
        ((days * 24 + hours) * 60 + minutes) * 60 + seconds,
    ))
}

/// Elapsed time as qstat prints it: `hours:minutes`, or a placeholder
/// like `--` before the job has started.
pub(crate) fn parse_hhmm(text: &str) -> Option<Duration> {
    let (h, m) = text.split_once(':')?;
    let hours = h.parse::<u64>().ok()?;
    let minutes = m.parse::<u64>().ok()?;
    Some(Duration::from_secs((hours * 60 + minutes) * 60))
}

pub(crate) fn render_slurm_script(request: &JobRequest) -> String {
    let spec = &request.resources;
    let mut script = String::new();
    script.push_str("#!/bin/bash\n");
    let _ = writeln!(script, "#SBATCH --job-name={}", request.name);
    script.push_str("#SBATCH --ntasks=1\n");
    let _ = writeln!(script, "#SBATCH --cpus-per-task={}", spec.cores);
    let _ = writeln!(script, "#SBATCH --mem={}gb", spec.memory_gb);
    let _ = writeln!(script, "#SBATCH --partition={}", spec.queue);
    let _ = writeln!(script, "#SBATCH --time={}", format_walltime(spec.walltime));
    let _ = writeln!(script, "#SBATCH --output={}", request.stdout_log.display());
    let _ = writeln!(script, "#SBATCH --error={}", request.stderr_log.display());
    if !spec.exclude.is_empty() {
        let _ = writeln!(script, "#SBATCH --exclude={}", spec.exclude.join(","));
    }
    script.push_str("cd $SLURM_SUBMIT_DIR\n");
    script.push_str(&request.command);
    script.push('\n');
    script
}

/// PBS has no exclude directive, so host selection happens before
/// rendering; `host` pins the job to one node from the inventory.
pub(crate) fn render_pbs_script(request: &JobRequest, host: Option<&str>) -> String {
    let spec = &request.resources;
    let mut script = String::new();
    script.push_str("#!/bin/bash\n");
    let _ = writeln!(script, "#PBS -N {}", request.name);
    let _ = writeln!(
        script,
        "#PBS -l nodes={}:ppn={}",
        host.unwrap_or("1"),
        spec.cores
    );
    let _ = writeln!(script, "#PBS -l mem={}gb", spec.memory_gb);
    let _ = writeln!(script, "#PBS -q {}", spec.queue);
    let _ = writeln!(script, "#PBS -l walltime={}", format_walltime(spec.walltime));
    let _ = writeln!(script, "#PBS -o {}", request.stdout_log.display());
    let _ = writeln!(script, "#PBS -e {}", request.stderr_log.display());
    script.push_str("cd $PBS_O_WORKDIR\n");
    script.push_str(&request.command);
    script.push('\n');
    script
}
