//! Sysmon operational event codes.

use super::hash::extract_sha256;
use super::security::raise;
use super::{or_unknown, split_account, Fields};
use crate::event::{Event, Severity};

pub(crate) fn enrich(ev: &mut Event, f: &mut Fields) -> bool {
    match ev.event_code {
        1 => process_create(ev, f),
        2 => file_time_changed(ev, f),
        3 => network_connect(ev, f),
        5 => process_terminate(ev, f),
        6 => driver_load(ev, f),
        7 => image_load(ev, f),
        8 => remote_thread(ev, f),
        10 => process_access(ev, f),
        11 => file_create(ev, f),
        12 | 13 | 14 => registry(ev, f),
        15 => file_stream(ev, f),
        17 | 18 => pipe(ev, f),
        19 | 20 | 21 => wmi(ev, f),
        22 => dns_query(ev, f),
        23 | 26 => file_delete(ev, f),
        _ => return false,
    }
    raise(ev, floor(ev.event_code));
    true
}

fn floor(code: u32) -> Severity {
    match code {
        8 => Severity::High,
        6 | 10 | 19 | 20 | 21 => Severity::Medium,
        1 | 3 | 12 | 13 | 14 | 15 | 23 | 26 => Severity::Low,
        _ => Severity::Info,
    }
}

fn user(ev: &mut Event, f: &mut Fields) {
    let (domain, name) = split_account(&f.take("User"));
    ev.subject_domain = domain;
    ev.subject_user = name;
}

fn image(ev: &mut Event, f: &mut Fields) {
    ev.process_id = f.take_u32("ProcessId");
    ev.process_name = f.take("Image");
}

fn process_create(ev: &mut Event, f: &mut Fields) {
    image(ev, f);
    user(ev, f);
    ev.subject_logon_id = f.take("LogonId");
    ev.command_line = f.take("CommandLine");
    ev.parent_process_id = f.take_u32("ParentProcessId");
    ev.parent_process_name = f.take("ParentImage");
    ev.file_hash = extract_sha256(&f.take("Hashes"));
    ev.message = format!(
        "Process created: {} (PID {}) by {}, parent {}: {}",
        or_unknown(&ev.process_name),
        ev.process_id,
        or_unknown(&ev.subject_user),
        or_unknown(&ev.parent_process_name),
        ev.command_line,
    );
}

fn file_time_changed(ev: &mut Event, f: &mut Fields) {
    image(ev, f);
    user(ev, f);
    ev.file_path = f.take("TargetFilename");
    ev.message = format!(
        "File creation time changed: {} by {} ({} -> {})",
        or_unknown(&ev.file_path),
        or_unknown(&ev.process_name),
        or_unknown(f.peek("PreviousCreationUtcTime")),
        or_unknown(f.peek("CreationUtcTime")),
    );
}

fn network_connect(ev: &mut Event, f: &mut Fields) {
    image(ev, f);
    user(ev, f);
    ev.protocol = f.take("Protocol");
    ev.source_ip = f.take("SourceIp");
    ev.source_port = f.take_u16("SourcePort");
    ev.destination_ip = f.take("DestinationIp");
    ev.destination_port = f.take_u16("DestinationPort");
    let host = f.peek("DestinationHostname");
    let dest = if host.is_empty() || host == "-" {
        ev.destination_ip.clone()
    } else {
        format!("{} ({})", ev.destination_ip, host)
    };
    ev.message = format!(
        "Network connection: {} {}:{} -> {}:{} [{}]",
        or_unknown(&ev.process_name),
        or_unknown(&ev.source_ip),
        ev.source_port,
        or_unknown(&dest),
        ev.destination_port,
        or_unknown(&ev.protocol),
    );
}

fn process_terminate(ev: &mut Event, f: &mut Fields) {
    image(ev, f);
    user(ev, f);
    ev.message = format!(
        "Process terminated: {} (PID {})",
        or_unknown(&ev.process_name),
        ev.process_id
    );
}

fn driver_load(ev: &mut Event, f: &mut Fields) {
    ev.file_path = f.take("ImageLoaded");
    ev.file_hash = extract_sha256(&f.take("Hashes"));
    ev.message = format!(
        "Driver loaded: {} (signed: {}, signature: {})",
        or_unknown(&ev.file_path),
        or_unknown(f.peek("Signed")),
        or_unknown(f.peek("Signature")),
    );
}

fn image_load(ev: &mut Event, f: &mut Fields) {
    image(ev, f);
    user(ev, f);
    ev.file_path = f.take("ImageLoaded");
    ev.file_hash = extract_sha256(&f.take("Hashes"));
    ev.message = format!(
        "Image loaded: {} into {} (PID {})",
        or_unknown(&ev.file_path),
        or_unknown(&ev.process_name),
        ev.process_id,
    );
}

fn source_target(ev: &mut Event, f: &mut Fields) -> (u32, String) {
    ev.process_id = f.take_u32("SourceProcessId");
    ev.process_name = f.take("SourceImage");
    let (domain, name) = split_account(&f.take("SourceUser"));
    ev.subject_domain = domain;
    ev.subject_user = name;
    let target_pid = f.take_u32("TargetProcessId");
    let target_image = f.take("TargetImage");
    (target_pid, target_image)
}

fn remote_thread(ev: &mut Event, f: &mut Fields) {
    let (target_pid, target_image) = source_target(ev, f);
    ev.message = format!(
        "Remote thread created: {} (PID {}) -> {} (PID {})",
        or_unknown(&ev.process_name),
        ev.process_id,
        or_unknown(&target_image),
        target_pid,
    );
    ev.extra.insert("TargetImage".to_string(), target_image);
    ev.extra.insert("TargetProcessId".to_string(), target_pid.to_string());
}

fn process_access(ev: &mut Event, f: &mut Fields) {
    let (target_pid, target_image) = source_target(ev, f);
    ev.message = format!(
        "Process access: {} (PID {}) opened {} (PID {}) with access {}",
        or_unknown(&ev.process_name),
        ev.process_id,
        or_unknown(&target_image),
        target_pid,
        or_unknown(f.peek("GrantedAccess")),
    );
    ev.extra.insert("TargetImage".to_string(), target_image);
    ev.extra.insert("TargetProcessId".to_string(), target_pid.to_string());
}

fn file_create(ev: &mut Event, f: &mut Fields) {
    image(ev, f);
    user(ev, f);
    ev.file_path = f.take("TargetFilename");
    ev.message = format!(
        "File created: {} by {}",
        or_unknown(&ev.file_path),
        or_unknown(&ev.process_name)
    );
}

fn registry(ev: &mut Event, f: &mut Fields) {
    image(ev, f);
    user(ev, f);
    ev.registry_path = f.take("TargetObject");
    let kind = f.take("EventType");
    let detail = match ev.event_code {
        13 => format!(" = {}", f.take("Details")),
        14 => format!(" -> {}", f.take("NewName")),
        _ => String::new(),
    };
    ev.message = format!(
        "Registry {}: {}{} by {}",
        or_unknown(&kind),
        or_unknown(&ev.registry_path),
        detail,
        or_unknown(&ev.process_name),
    );
    ev.extra.insert("EventType".to_string(), kind);
}

fn file_stream(ev: &mut Event, f: &mut Fields) {
    image(ev, f);
    user(ev, f);
    ev.file_path = f.take("TargetFilename");
    ev.file_hash = extract_sha256(&f.take_any(&["Hash", "Hashes"]));
    ev.message = format!(
        "File stream created: {} by {}",
        or_unknown(&ev.file_path),
        or_unknown(&ev.process_name)
    );
}

fn pipe(ev: &mut Event, f: &mut Fields) {
    image(ev, f);
    user(ev, f);
    ev.file_path = f.take("PipeName");
    let action = if ev.event_code == 17 { "created" } else { "connected" };
    ev.message = format!(
        "Named pipe {}: {} by {}",
        action,
        or_unknown(&ev.file_path),
        or_unknown(&ev.process_name)
    );
}

fn wmi(ev: &mut Event, f: &mut Fields) {
    user(ev, f);
    let operation = f.take("Operation");
    let name = f.take_any(&["Name", "Consumer"]);
    let what = match ev.event_code {
        19 => "filter",
        20 => "consumer",
        _ => "binding",
    };
    let detail = f.take_any(&["Query", "Destination", "Filter"]);
    ev.command_line = detail;
    ev.message = format!(
        "WMI event {} {}: {} by {}",
        what,
        or_unknown(&operation),
        or_unknown(&name),
        or_unknown(&ev.subject_user),
    );
    ev.extra.insert("Operation".to_string(), operation);
    ev.extra.insert("Name".to_string(), name);
}

fn dns_query(ev: &mut Event, f: &mut Fields) {
    image(ev, f);
    user(ev, f);
    let query = f.take("QueryName");
    ev.message = format!(
        "DNS query: {} by {} -> {}",
        or_unknown(&query),
        or_unknown(&ev.process_name),
        or_unknown(f.peek("QueryResults")),
    );
    ev.extra.insert("QueryName".to_string(), query);
}

fn file_delete(ev: &mut Event, f: &mut Fields) {
    image(ev, f);
    user(ev, f);
    ev.file_path = f.take("TargetFilename");
    ev.file_hash = extract_sha256(&f.take("Hashes"));
    ev.message = format!(
        "File deleted: {} by {}",
        or_unknown(&ev.file_path),
        or_unknown(&ev.process_name)
    );
}
