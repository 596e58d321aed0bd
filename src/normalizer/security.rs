//! Windows Security, System and PowerShell event codes.

use super::{or_unknown, qualified, Fields};
use crate::event::{Event, Severity};

/// Populate code-specific fields. Returns false for codes this table does not know.
pub(crate) fn enrich(ev: &mut Event, f: &mut Fields) -> bool {
    match ev.event_code {
        4624 => logon_success(ev, f),
        4625 => logon_failure(ev, f),
        4634 | 4647 => logoff(ev, f),
        4688 => process_creation(ev, f),
        4663 => object_access(ev, f),
        4697 | 7045 => service_install(ev, f),
        5140 | 5145 => share_access(ev, f),
        1102 | 104 => log_cleared(ev, f),
        4720 | 4726 | 4740 => account_change(ev, f),
        4728 | 4732 | 4756 => group_member_added(ev, f),
        4104 => script_block(ev, f),
        _ => return false,
    }
    raise(ev, floor(ev.event_code));
    true
}

fn floor(code: u32) -> Severity {
    match code {
        1102 | 104 => Severity::Critical,
        4697 | 7045 | 4740 | 4728 | 4732 | 4756 => Severity::High,
        4625 | 4720 | 4726 | 4104 => Severity::Medium,
        4688 | 5140 | 5145 | 4663 => Severity::Low,
        _ => Severity::Info,
    }
}

pub(crate) fn raise(ev: &mut Event, min: Severity) {
    if ev.severity < min {
        ev.severity = min;
    }
}

fn subject(ev: &mut Event, f: &mut Fields) {
    ev.subject_user = f.take("SubjectUserName");
    ev.subject_domain = f.take("SubjectDomainName");
    ev.subject_logon_id = f.take("SubjectLogonId");
}

fn target(ev: &mut Event, f: &mut Fields) {
    ev.target_user = f.take("TargetUserName");
    ev.target_domain = f.take("TargetDomainName");
    ev.target_logon_id = f.take("TargetLogonId");
}

fn logon_common(ev: &mut Event, f: &mut Fields) {
    subject(ev, f);
    target(ev, f);
    ev.logon_type = f.take_u32("LogonType");
    ev.auth_package = f.take("AuthenticationPackageName");
    ev.source_ip = f.take("IpAddress");
    ev.source_port = f.take_u16("IpPort");
    ev.process_id = f.take_u32("ProcessId");
    ev.process_name = f.take("ProcessName");
}

fn logon_success(ev: &mut Event, f: &mut Fields) {
    logon_common(ev, f);
    ev.message = format!(
        "Successful logon: {} (type {}) from {}",
        qualified(&ev.target_domain, or_unknown(&ev.target_user)),
        ev.logon_type,
        or_unknown(&ev.source_ip),
    );
}

fn logon_failure(ev: &mut Event, f: &mut Fields) {
    logon_common(ev, f);
    let sub_status = f.take("SubStatus");
    let status = f.take("Status");
    let reason = f.take("FailureReason");
    ev.failure_reason = failure_reason(&sub_status)
        .or_else(|| failure_reason(&status))
        .map(str::to_string)
        .unwrap_or(reason);
    if !sub_status.is_empty() {
        ev.extra.insert("SubStatus".to_string(), sub_status);
    }
    ev.message = format!(
        "Failed logon for {} from {} (type {}): {}",
        qualified(&ev.target_domain, or_unknown(&ev.target_user)),
        or_unknown(&ev.source_ip),
        ev.logon_type,
        or_unknown(&ev.failure_reason),
    );
}

/// NTSTATUS codes carried by 4625 `Status` / `SubStatus`.
pub fn failure_reason(status: &str) -> Option<&'static str> {
    let reason = match status.to_ascii_lowercase().as_str() {
        "0xc000006a" => "bad password",
        "0xc0000064" => "unknown user name",
        "0xc000006d" => "bad user name or password",
        "0xc0000234" => "account locked out",
        "0xc0000072" => "account disabled",
        "0xc000006f" => "logon outside permitted hours",
        "0xc0000070" => "workstation restriction",
        "0xc0000071" => "password expired",
        "0xc0000193" => "account expired",
        "0xc0000224" => "password must change",
        "0xc000015b" => "logon type not granted",
        _ => return None,
    };
    Some(reason)
}

fn logoff(ev: &mut Event, f: &mut Fields) {
    target(ev, f);
    ev.logon_type = f.take_u32("LogonType");
    ev.message = format!(
        "Logoff: {}",
        qualified(&ev.target_domain, or_unknown(&ev.target_user))
    );
}

fn process_creation(ev: &mut Event, f: &mut Fields) {
    subject(ev, f);
    ev.target_user = f.take("TargetUserName");
    ev.target_domain = f.take("TargetDomainName");
    ev.process_id = f.take_u32("NewProcessId");
    ev.process_name = f.take("NewProcessName");
    ev.command_line = f.take("CommandLine");
    ev.parent_process_id = f.take_u32("ProcessId");
    ev.parent_process_name = f.take("ParentProcessName");
    ev.message = format!(
        "Process created: {} (PID {}) by {}",
        or_unknown(&ev.process_name),
        ev.process_id,
        qualified(&ev.subject_domain, or_unknown(&ev.subject_user)),
    );
}

fn object_access(ev: &mut Event, f: &mut Fields) {
    subject(ev, f);
    ev.file_path = f.take("ObjectName");
    ev.process_id = f.take_u32("ProcessId");
    ev.process_name = f.take("ProcessName");
    ev.message = format!(
        "Object access: {} ({}) by {} via {}",
        or_unknown(&ev.file_path),
        or_unknown(f.peek("ObjectType")),
        qualified(&ev.subject_domain, or_unknown(&ev.subject_user)),
        or_unknown(&ev.process_name),
    );
}

fn service_install(ev: &mut Event, f: &mut Fields) {
    subject(ev, f);
    ev.service_name = f.take("ServiceName");
    ev.file_path = f.take_any(&["ServiceFileName", "ImagePath"]);
    ev.service_account = f.take_any(&["ServiceAccount", "AccountName"]);
    ev.message = format!(
        "Service installed: {} ({}) running as {}",
        or_unknown(&ev.service_name),
        or_unknown(&ev.file_path),
        or_unknown(&ev.service_account),
    );
}

fn share_access(ev: &mut Event, f: &mut Fields) {
    subject(ev, f);
    ev.source_ip = f.take("IpAddress");
    ev.source_port = f.take_u16("IpPort");
    let share = f.take("ShareName");
    let relative = f.take("RelativeTargetName");
    ev.file_path = match (f.take("ShareLocalPath"), relative.is_empty()) {
        (local, true) => local,
        (local, false) if local.is_empty() => relative.clone(),
        (local, false) => format!("{}\\{}", local.trim_end_matches('\\'), relative),
    };
    ev.message = format!(
        "Network share {} accessed by {} from {}",
        or_unknown(&share),
        qualified(&ev.subject_domain, or_unknown(&ev.subject_user)),
        or_unknown(&ev.source_ip),
    );
    ev.extra.insert("ShareName".to_string(), share);
}

fn log_cleared(ev: &mut Event, f: &mut Fields) {
    subject(ev, f);
    let log = f.take("Channel");
    let what = if ev.event_code == 1102 {
        "Security audit log".to_string()
    } else if log.is_empty() {
        "Event log".to_string()
    } else {
        format!("Event log {}", log)
    };
    ev.message = format!(
        "{} cleared by {}",
        what,
        qualified(&ev.subject_domain, or_unknown(&ev.subject_user)),
    );
}

fn account_change(ev: &mut Event, f: &mut Fields) {
    subject(ev, f);
    ev.target_user = f.take("TargetUserName");
    ev.target_domain = f.take("TargetDomainName");
    let action = match ev.event_code {
        4720 => "User account created",
        4726 => "User account deleted",
        _ => "User account locked out",
    };
    ev.message = format!(
        "{}: {} by {}",
        action,
        qualified(&ev.target_domain, or_unknown(&ev.target_user)),
        qualified(&ev.subject_domain, or_unknown(&ev.subject_user)),
    );
}

fn group_member_added(ev: &mut Event, f: &mut Fields) {
    subject(ev, f);
    let member = f.take_any(&["MemberName", "MemberSid"]);
    let group = f.take("TargetUserName");
    ev.target_user = member;
    ev.target_domain = f.take("TargetDomainName");
    ev.message = format!(
        "Member {} added to group {} by {}",
        or_unknown(&ev.target_user),
        or_unknown(&group),
        qualified(&ev.subject_domain, or_unknown(&ev.subject_user)),
    );
    ev.extra.insert("Group".to_string(), group);
}

fn script_block(ev: &mut Event, f: &mut Fields) {
    ev.command_line = f.take("ScriptBlockText");
    ev.file_path = f.take("Path");
    let preview: String = ev.command_line.chars().take(120).collect();
    ev.message = format!("PowerShell script block executed: {}", preview);
}

#[cfg(test)]
mod tests {
    use crate::event::Severity;
    use crate::normalizer::{Normalizer, RawEvent};
    use chrono::Utc;

    fn security(id: u32, data: &[(&str, &str)]) -> crate::event::Event {
        let raw = RawEvent {
            provider: "Microsoft-Windows-Security-Auditing".to_string(),
            event_id: id,
            channel: "Security".to_string(),
            computer: "WS01".to_string(),
            data: data
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        };
        Normalizer::new().normalize(&raw, "Security", Utc::now()).unwrap()
    }

    #[test]
    fn logon_failure_fields_and_message() {
        let ev = security(
            4625,
            &[
                ("TargetUserName", "alice"),
                ("TargetDomainName", "CORP"),
                ("IpAddress", "10.0.0.5"),
                ("IpPort", "51515"),
                ("LogonType", "3"),
                ("SubStatus", "0xC000006A"),
                ("WorkstationName", "KIOSK"),
            ],
        );
        assert_eq!(ev.target_user, "alice");
        assert_eq!(ev.source_ip, "10.0.0.5");
        assert_eq!(ev.source_port, 51515);
        assert_eq!(ev.logon_type, 3);
        assert_eq!(ev.failure_reason, "bad password");
        assert!(ev.message.contains("alice"));
        assert!(ev.message.contains("10.0.0.5"));
        assert_eq!(ev.severity, Severity::Medium);
        assert_eq!(ev.extra.get("WorkstationName").map(String::as_str), Some("KIOSK"));
    }

    #[test]
    fn dash_placeholders_are_empty() {
        let ev = security(4624, &[("TargetUserName", "bob"), ("IpAddress", "-"), ("LogonType", "2")]);
        assert!(ev.source_ip.is_empty());
        assert!(ev.message.contains("from unknown"));
    }

    #[test]
    fn process_creation_parses_hex_pids() {
        let ev = security(
            4688,
            &[
                ("NewProcessId", "0x1a4"),
                ("NewProcessName", "C:\\Windows\\System32\\cmd.exe"),
                ("ProcessId", "0x10"),
                ("CommandLine", "cmd.exe /c whoami"),
                ("SubjectUserName", "carol"),
                ("SubjectDomainName", "CORP"),
            ],
        );
        assert_eq!(ev.process_id, 420);
        assert_eq!(ev.parent_process_id, 16);
        assert_eq!(ev.command_line, "cmd.exe /c whoami");
        assert!(ev.message.contains("CORP\\carol"));
    }

    #[test]
    fn malformed_pid_is_zero_not_failure() {
        let ev = security(4688, &[("NewProcessId", "0xZZ"), ("NewProcessName", "x.exe")]);
        assert_eq!(ev.process_id, 0);
        assert_eq!(ev.process_name, "x.exe");
    }

    #[test]
    fn service_install_from_system_log() {
        let ev = security(
            7045,
            &[
                ("ServiceName", "evilsvc"),
                ("ImagePath", "C:\\temp\\evil.exe"),
                ("AccountName", "LocalSystem"),
            ],
        );
        assert_eq!(ev.service_name, "evilsvc");
        assert_eq!(ev.file_path, "C:\\temp\\evil.exe");
        assert_eq!(ev.service_account, "LocalSystem");
        assert_eq!(ev.severity, Severity::High);
    }

    #[test]
    fn audit_log_clear_is_critical() {
        let ev = security(1102, &[("SubjectUserName", "mallory"), ("SubjectDomainName", "CORP")]);
        assert_eq!(ev.severity, Severity::Critical);
        assert_eq!(ev.message, "Security audit log cleared by CORP\\mallory");
    }

    #[test]
    fn share_access_joins_paths() {
        let ev = security(
            5145,
            &[
                ("ShareName", "\\\\*\\C$"),
                ("ShareLocalPath", "\\??\\C:\\"),
                ("RelativeTargetName", "Users\\x.txt"),
                ("IpAddress", "10.0.0.9"),
                ("SubjectUserName", "dave"),
            ],
        );
        assert_eq!(ev.file_path, "\\??\\C:\\Users\\x.txt");
        assert!(ev.message.contains("10.0.0.9"));
    }

    #[test]
    fn object_access_message_mentions_object() {
        let ev = security(
            4663,
            &[
                ("ObjectName", "C:\\secret.txt"),
                ("ObjectType", "File"),
                ("ProcessName", "C:\\x.exe"),
                ("SubjectUserName", "erin"),
            ],
        );
        assert_eq!(ev.file_path, "C:\\secret.txt");
        assert!(ev.message.contains("(File)"));
        assert_eq!(ev.extra.get("ObjectType").map(String::as_str), Some("File"));
    }
}
