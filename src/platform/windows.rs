//! Windows adapters: `wevtapi` pull subscriptions, `sc`/`icacls` for the
//! service and file ACLs, registry and SCM listings for inventory.

use super::{
    parse_sc_state, run_command, AclApplier, ChannelSubscription, EventSource, InventoryProvider,
    PlatformError, ServiceController, ServiceState, SourceError,
};
use crate::inventory::{parse_reg_uninstall, parse_sc_query_all, ServiceEntry, SoftwareEntry};
use async_trait::async_trait;
use std::path::Path;
use windows::core::{HSTRING, PCWSTR};
use windows::Win32::Foundation::{
    CloseHandle, ERROR_INSUFFICIENT_BUFFER, ERROR_NO_MORE_ITEMS, ERROR_TIMEOUT, HANDLE,
};
use windows::Win32::System::EventLog::{
    EvtClose, EvtNext, EvtRender, EvtRenderEventXml, EvtSubscribe, EvtSubscribeToFutureEvents,
    EVT_HANDLE,
};
use windows::Win32::System::Threading::CreateEventW;

const UNINSTALL_KEYS: &[&str] = &[
    r"HKLM\SOFTWARE\Microsoft\Windows\CurrentVersion\Uninstall",
    r"HKLM\SOFTWARE\WOW6432Node\Microsoft\Windows\CurrentVersion\Uninstall",
];

/// SYSTEM and built-in administrators only.
const SERVICE_SDDL: &str =
    "D:(A;;CCDCLCSWRPWPDTLOCRSDRCWDWO;;;SY)(A;;CCDCLCSWRPWPDTLOCRSDRCWDWO;;;BA)";

pub struct WevtEventSource;

impl EventSource for WevtEventSource {
    fn subscribe(&self, channel: &str) -> Result<Box<dyn ChannelSubscription>, SourceError> {
        let subscribe_err = |reason: String| SourceError::Subscribe {
            channel: channel.to_string(),
            reason,
        };
        // SAFETY: all pointers are valid for the duration of the calls; handles
        // are owned by the returned subscription and closed on drop.
        unsafe {
            let signal = CreateEventW(None, true, true, PCWSTR::null())
                .map_err(|e| subscribe_err(e.message().to_string()))?;
            let path = HSTRING::from(channel);
            let query = HSTRING::from("*");
            match EvtSubscribe(
                EVT_HANDLE::default(),
                signal,
                &path,
                &query,
                EVT_HANDLE::default(),
                None,
                None,
                EvtSubscribeToFutureEvents.0 as u32,
            ) {
                Ok(handle) => Ok(Box::new(WevtSubscription {
                    channel: channel.to_string(),
                    handle,
                    signal,
                })),
                Err(e) => {
                    let _ = CloseHandle(signal);
                    Err(subscribe_err(e.message().to_string()))
                }
            }
        }
    }
}

struct WevtSubscription {
    channel: String,
    handle: EVT_HANDLE,
    signal: HANDLE,
}

// The handles are plain kernel/wevtapi handles, usable from any thread.
unsafe impl Send for WevtSubscription {}

impl WevtSubscription {
    fn render(event: EVT_HANDLE) -> Result<String, SourceError> {
        let mut used = 0u32;
        let mut props = 0u32;
        // SAFETY: first call sizes the buffer, second fills it.
        unsafe {
            if let Err(e) = EvtRender(
                EVT_HANDLE::default(),
                event,
                EvtRenderEventXml.0 as u32,
                0,
                None,
                &mut used,
                &mut props,
            ) {
                if e.code() != ERROR_INSUFFICIENT_BUFFER.to_hresult() {
                    return Err(SourceError::Render(e.message().to_string()));
                }
            }
            let mut buf = vec![0u16; (used as usize / 2) + 1];
            EvtRender(
                EVT_HANDLE::default(),
                event,
                EvtRenderEventXml.0 as u32,
                (buf.len() * 2) as u32,
                Some(buf.as_mut_ptr().cast()),
                &mut used,
                &mut props,
            )
            .map_err(|e| SourceError::Render(e.message().to_string()))?;
            let end = buf.iter().position(|c| *c == 0).unwrap_or(buf.len());
            Ok(String::from_utf16_lossy(&buf[..end]))
        }
    }
}

impl ChannelSubscription for WevtSubscription {
    fn next_batch(&mut self, max: usize) -> Result<Vec<Result<String, SourceError>>, SourceError> {
        let mut raw = vec![0isize; max.max(1)];
        let mut returned = 0u32;
        // SAFETY: `raw` has room for `raw.len()` handles; each returned handle is closed below.
        let next = unsafe { EvtNext(self.handle, &mut raw, 0, 0, &mut returned) };
        if let Err(e) = next {
            let code = e.code();
            if code == ERROR_NO_MORE_ITEMS.to_hresult() || code == ERROR_TIMEOUT.to_hresult() {
                return Ok(Vec::new());
            }
            return Err(SourceError::Read {
                channel: self.channel.clone(),
                reason: e.message().to_string(),
            });
        }
        let out = raw[..returned as usize]
            .iter()
            .map(|h| {
                let event = EVT_HANDLE(*h);
                let xml = Self::render(event);
                // SAFETY: handle came from EvtNext and is closed exactly once.
                unsafe {
                    let _ = EvtClose(event);
                }
                xml
            })
            .collect();
        Ok(out)
    }
}

impl Drop for WevtSubscription {
    fn drop(&mut self) {
        // SAFETY: both handles were opened in `subscribe` and are not used after drop.
        unsafe {
            let _ = EvtClose(self.handle);
            let _ = CloseHandle(self.signal);
        }
    }
}

pub struct ScServiceController;

#[async_trait]
impl ServiceController for ScServiceController {
    async fn state(&self, service: &str) -> Result<ServiceState, PlatformError> {
        let out = run_command("sc.exe", &["query", service]).await?;
        Ok(parse_sc_state(&out.stdout))
    }
}

pub struct IcaclsApplier;

#[async_trait]
impl AclApplier for IcaclsApplier {
    async fn harden_path(&self, path: &Path) -> Result<(), PlatformError> {
        let target = path.to_string_lossy().to_string();
        let (system, admins) = if path.is_dir() {
            ("*S-1-5-18:(OI)(CI)F", "*S-1-5-32-544:(OI)(CI)F")
        } else {
            ("*S-1-5-18:F", "*S-1-5-32-544:F")
        };
        run_command(
            "icacls.exe",
            &[&target, "/inheritance:r", "/grant:r", system, "/grant:r", admins],
        )
        .await?
        .into_stdout("icacls")
        .map(|_| ())
    }

    async fn harden_service(&self, service: &str) -> Result<(), PlatformError> {
        run_command("sc.exe", &["sdset", service, SERVICE_SDDL])
            .await?
            .into_stdout("sc sdset")
            .map(|_| ())
    }
}

pub struct RegistryInventory;

#[async_trait]
impl InventoryProvider for RegistryInventory {
    async fn installed_software(&self) -> Result<Vec<SoftwareEntry>, PlatformError> {
        let mut all = Vec::new();
        for key in UNINSTALL_KEYS {
            let out = run_command("reg.exe", &["query", key, "/s"]).await?;
            // the WOW6432Node hive is absent on 32-bit systems
            if out.success() {
                all.extend(parse_reg_uninstall(&out.stdout));
            }
        }
        all.sort_by(|a, b| a.name.cmp(&b.name).then(a.version.cmp(&b.version)));
        all.dedup_by(|a, b| a.name == b.name && a.version == b.version);
        Ok(all)
    }

    async fn services(&self) -> Result<Vec<ServiceEntry>, PlatformError> {
        let out = run_command("sc.exe", &["query", "type=", "service", "state=", "all"])
            .await?
            .into_stdout("sc query")?;
        Ok(parse_sc_query_all(&out))
    }
}
