//! Console banners
//!
//! The boxed, colored announcements the agent prints around session
//! milestones: public addresses, session start/finish and the outdated
//! version warning.

use colored::Colorize;
use indihub_core::proxy::PublicServerAddr;

const PAD: &str = "                                ";
const RULE: &str =
    "************************************************************";

fn boxed(lines: &[String], color: fn(&str) -> colored::ColoredString) {
    println!();
    println!("{PAD}{}", color(RULE));
    for line in lines {
        println!("{PAD}{}", color(line));
    }
    println!("{PAD}{}", color(RULE));
    println!();
}

fn cyan(s: &str) -> colored::ColoredString {
    s.cyan()
}

fn green(s: &str) -> colored::ColoredString {
    s.green()
}

fn yellow(s: &str) -> colored::ColoredString {
    s.yellow()
}

/// Warn when the relay reports a newer agent build.
pub fn version_check(current: &str, latest: &str) {
    if current >= latest {
        return;
    }
    boxed(
        &[
            "*          WARNING: your version of agent is outdated!     *".to_string(),
            "*                                                          *".to_string(),
            "*          Please download the latest version from:        *".to_string(),
            "*          https://indihub.space/downloads                 *".to_string(),
        ],
        yellow,
    );
}

pub fn public_address_list(addrs: &[PublicServerAddr]) {
    boxed(
        &["*               INDIHUB public address list!!              *".to_string()],
        cyan,
    );
    for addr in addrs {
        println!("{PAD}   {}", format!("{}: {}", addr.name, addr.addr).green());
    }
    println!();
    println!("{PAD}{}", "Please provide your guest with this information:".cyan());
    println!();
    println!("{PAD}{}", "1. Public address list from the above".cyan());
    println!("{PAD}{}", "2. Focal length and aperture of your main telescope".cyan());
    println!("{PAD}{}", "3. Focal length and aperture of your guiding telescope".cyan());
    println!("{PAD}{}", "4. Type of guiding you use: PHD2 or guiding via camera".cyan());
    println!("{PAD}{}", "5. Names of your imaging camera and guiding cameras".cyan());
    println!();
    println!("{PAD}{}", "NOTE: These public addresses will be available ONLY until".yellow());
    println!("{PAD}{}", "agent is running! (Ctrl+C will stop the session)".yellow());
    println!();
}

pub fn robotic_session_started() {
    boxed(
        &["*               INDIHUB robotic-session started!!          *".to_string()],
        cyan,
    );
}

pub fn broadcast_address(addr: &str) {
    boxed(
        &[
            "*                INDIHUB broadcast address !!              *".to_string(),
            format!("              {addr}"),
        ],
        cyan,
    );
}

/// Closing banner for share and robotic sessions.
pub fn session_finished(addrs: &[PublicServerAddr], robotic: bool) {
    boxed(
        &["*               INDIHUB session finished!!                 *".to_string()],
        cyan,
    );
    if robotic {
        println!("{PAD}{}", "*         INDIHUB robotic-session finished.                *".cyan());
        println!("{PAD}{}", "*         Thank you for your contribution!                 *".cyan());
        println!();
        return;
    }
    for addr in addrs {
        println!(
            "{PAD}   {}",
            format!("{}: {} - CLOSED!!", addr.name, addr.addr).magenta()
        );
    }
    println!();
}

pub fn solo_session_finished(images_num: u64) {
    boxed(
        &["*              INDIHUB solo session finished!!             *".to_string()],
        green,
    );
    println!(
        "{PAD}   {}",
        format!("Processed {images_num} images. Thank you for your contribution!").green()
    );
    println!();
}
