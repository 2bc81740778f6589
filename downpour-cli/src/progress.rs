//! Terminal progress rendering.

use std::sync::mpsc::Receiver;

use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use downpour::DownloadEvent;

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "{bar:40.cyan/blue} {bytes}/{total_bytes} ({bytes_per_sec}, eta {eta})",
    )
    .expect("static template")
    .progress_chars("=> ")
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner} {bytes} ({bytes_per_sec})").expect("static template")
}

/// Consume the download's event channel and drive a progress bar until a
/// terminal event arrives.
pub fn render(events: Receiver<DownloadEvent>) {
    let bar = ProgressBar::hidden();
    bar.set_style(spinner_style());

    for event in events {
        match event {
            DownloadEvent::Started { .. } => {
                bar.set_draw_target(indicatif::ProgressDrawTarget::stderr());
                bar.enable_steady_tick(std::time::Duration::from_millis(120));
            }
            DownloadEvent::Progress { downloaded, total, .. } => {
                match total {
                    Some(total) => {
                        if bar.length() != Some(total) {
                            bar.set_style(bar_style());
                            bar.set_length(total);
                        }
                        bar.set_position(downloaded);
                    }
                    None => bar.set_position(downloaded),
                }
            }
            DownloadEvent::Finished { target, .. } => {
                bar.finish_and_clear();
                eprintln!("{} {}", style("saved").green().bold(), target.display());
                break;
            }
            DownloadEvent::Failed { kind, .. } => {
                bar.abandon();
                eprintln!("{} {}", style("failed:").red().bold(), kind);
                break;
            }
            DownloadEvent::Cancelled { .. } => {
                bar.abandon();
                eprintln!("{}", style("cancelled").yellow());
                break;
            }
        }
    }
}
