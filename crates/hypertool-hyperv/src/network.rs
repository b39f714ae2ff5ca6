//! Hyper-V networking: virtual switches, VM network adapters, and the
//! host's uplink adapters.

use crate::error::{require_name, HyperVResult};
use crate::powershell::{PsRunner, PsScripts};
use crate::rows::RowView;
use crate::types::*;
use log::{debug, info};
use std::net::Ipv4Addr;
use tokio_util::sync::CancellationToken;

/// Interface alias of the NAT adapter behind Hyper-V's "Default Switch".
pub const DEFAULT_SWITCH_ADAPTER: &str = "vEthernet (Default Switch)";

/// Manager for Hyper-V virtual networking operations.
pub struct NetworkManager;

impl NetworkManager {
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    //  Virtual Switches
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// List all virtual switches.
    pub async fn list_switches(
        ps: &dyn PsRunner,
        cancel: &CancellationToken,
    ) -> HyperVResult<Vec<VirtualSwitchInfo>> {
        let script = r#"@(Get-VMSwitch | Select-Object Name,
            @{N='SwitchType';E={$_.SwitchType.ToString()}}
        ) | ConvertTo-Json -Depth 3 -Compress"#;
        let rows = ps.run_rows(script, cancel).await?;
        Ok(rows
            .iter()
            .map(|r| VirtualSwitchInfo {
                name: r.string("Name"),
                switch_type: SwitchType::from_ps_string(&r.string("SwitchType")),
            })
            .collect())
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    //  VM Network Adapters
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// List network adapters of a VM.
    pub async fn list_adapters(
        ps: &dyn PsRunner,
        vm_name: &str,
        cancel: &CancellationToken,
    ) -> HyperVResult<Vec<NetworkAdapterInfo>> {
        require_name(vm_name, "VM name")?;
        let script = format!(
            "@(Get-VMNetworkAdapter -VMName {} | Select-Object Name,SwitchName,MacAddress) {}",
            PsScripts::quote(vm_name),
            PsScripts::to_json(3)
        );
        let rows = ps.run_rows(&script, cancel).await?;
        Ok(rows
            .iter()
            .map(|r| NetworkAdapterInfo {
                name: r.string("Name"),
                switch_name: r.opt_string("SwitchName"),
                mac_address: r.string("MacAddress"),
            })
            .collect())
    }

    /// Switch of the VM's first adapter, `None` when disconnected or
    /// when the VM has no adapter.
    pub async fn get_current_switch(
        ps: &dyn PsRunner,
        vm_name: &str,
        cancel: &CancellationToken,
    ) -> HyperVResult<Option<String>> {
        let adapters = Self::list_adapters(ps, vm_name, cancel).await?;
        Ok(adapters.into_iter().next().and_then(|a| a.switch_name))
    }

    /// Connect a VM adapter to a switch. Without an adapter name every
    /// adapter of the VM is connected.
    pub async fn connect_adapter(
        ps: &dyn PsRunner,
        vm_name: &str,
        switch_name: &str,
        adapter_name: Option<&str>,
        cancel: &CancellationToken,
    ) -> HyperVResult<()> {
        require_name(vm_name, "VM name")?;
        require_name(switch_name, "Switch name")?;
        let mut cmd = format!("Connect-VMNetworkAdapter -VMName {}", PsScripts::quote(vm_name));
        if let Some(adapter) = non_blank(adapter_name) {
            cmd.push_str(&format!(" -Name {}", PsScripts::quote(adapter)));
        }
        cmd.push_str(&format!(" -SwitchName {}", PsScripts::quote(switch_name)));
        info!(
            "Connecting VM '{}' adapter {:?} to switch '{}'",
            vm_name, adapter_name, switch_name
        );
        ps.run_void(&cmd, cancel).await
    }

    /// Disconnect a VM adapter. Disconnecting a disconnected adapter is a
    /// no-op on the host and succeeds.
    pub async fn disconnect_adapter(
        ps: &dyn PsRunner,
        vm_name: &str,
        adapter_name: Option<&str>,
        cancel: &CancellationToken,
    ) -> HyperVResult<()> {
        require_name(vm_name, "VM name")?;
        let mut cmd = format!(
            "Disconnect-VMNetworkAdapter -VMName {}",
            PsScripts::quote(vm_name)
        );
        if let Some(adapter) = non_blank(adapter_name) {
            cmd.push_str(&format!(" -Name {}", PsScripts::quote(adapter)));
        }
        info!("Disconnecting VM '{}' adapter {:?}", vm_name, adapter_name);
        ps.run_void(&cmd, cancel).await
    }

    pub async fn rename_adapter(
        ps: &dyn PsRunner,
        vm_name: &str,
        old_name: &str,
        new_name: &str,
        cancel: &CancellationToken,
    ) -> HyperVResult<()> {
        require_name(vm_name, "VM name")?;
        require_name(old_name, "Adapter name")?;
        require_name(new_name, "New adapter name")?;
        info!(
            "Renaming adapter '{}' -> '{}' on VM '{}'",
            old_name, new_name, vm_name
        );
        ps.run_void(
            &format!(
                "Rename-VMNetworkAdapter -VMName {} -Name {} -NewName {}",
                PsScripts::quote(vm_name),
                PsScripts::quote(old_name),
                PsScripts::quote(new_name)
            ),
            cancel,
        )
        .await
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    //  Host Uplinks
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Host adapters with a default gateway or a live link, always
    /// including the Default Switch NAT adapter when it exists.
    pub async fn list_host_network_adapters_with_uplink(
        ps: &dyn PsRunner,
        cancel: &CancellationToken,
    ) -> HyperVResult<Vec<HostNetworkAdapterInfo>> {
        let script = r#"
@(Get-NetIPConfiguration -ErrorAction SilentlyContinue | ForEach-Object {
    $ips = @(@($_.IPv4Address) + @($_.IPv6Address) | Where-Object { $_ })
    $gw = @(@($_.IPv4DefaultGateway) + @($_.IPv6DefaultGateway) | Where-Object { $_ }) | Select-Object -First 1
    [PSCustomObject]@{
        AdapterName          = $_.InterfaceAlias
        InterfaceDescription = $_.InterfaceDescription
        Status               = if ($_.NetAdapter) { $_.NetAdapter.Status.ToString() } else { '' }
        IpAddresses          = @($ips | ForEach-Object { $_.IPAddress })
        PrefixLengths        = @($ips | ForEach-Object { [int]$_.PrefixLength })
        Gateway              = if ($gw) { $gw.NextHop } else { $null }
        DnsServers           = @($_.DNSServer | ForEach-Object { $_.ServerAddresses } | Where-Object { $_ })
    }
}) | ConvertTo-Json -Depth 4 -Compress
"#;
        let rows = ps.run_rows(script, cancel).await?;
        let mut adapters: Vec<HostNetworkAdapterInfo> = rows
            .iter()
            .filter(|r| has_uplink(r))
            .map(host_adapter_from_row)
            .collect();

        if !adapters.iter().any(|a| a.is_default_switch) {
            debug!("Default Switch adapter not in uplink list, querying it directly");
            if let Some(adapter) = Self::query_default_switch_adapter(ps, cancel).await? {
                adapters.push(adapter);
            }
        }
        Ok(adapters)
    }

    async fn query_default_switch_adapter(
        ps: &dyn PsRunner,
        cancel: &CancellationToken,
    ) -> HyperVResult<Option<HostNetworkAdapterInfo>> {
        let alias = PsScripts::quote(DEFAULT_SWITCH_ADAPTER);
        let script = format!(
            r#"
$adapter = Get-NetAdapter -Name {alias} -ErrorAction SilentlyContinue
$ips = @(Get-NetIPAddress -InterfaceAlias {alias} -ErrorAction SilentlyContinue)
if ($adapter -or $ips.Count -gt 0) {{
    [PSCustomObject]@{{
        AdapterName          = {alias}
        InterfaceDescription = if ($adapter) {{ $adapter.InterfaceDescription }} else {{ '' }}
        IpAddresses          = @($ips | ForEach-Object {{ $_.IPAddress }})
        PrefixLengths        = @($ips | ForEach-Object {{ [int]$_.PrefixLength }})
        Gateway              = $null
        DnsServers           = @()
    }} | ConvertTo-Json -Depth 4 -Compress
}}
"#
        );
        let rows = ps.run_rows(&script, cancel).await?;
        Ok(rows.first().map(|r| {
            let mut info = host_adapter_from_row(r);
            info.is_default_switch = true;
            if info.adapter_name.is_empty() {
                info.adapter_name = DEFAULT_SWITCH_ADAPTER.to_string();
            }
            info
        }))
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

fn has_uplink(row: &RowView) -> bool {
    row.opt_string("Gateway").is_some() || row.string("Status").eq_ignore_ascii_case("Up")
}

fn host_adapter_from_row(row: &RowView) -> HostNetworkAdapterInfo {
    let adapter_name = row.string("AdapterName");
    // Addresses and prefix lengths pair up by position; drop blanks only
    // after pairing.
    let pairs: Vec<(String, String)> = row
        .positional_strings("IpAddresses")
        .into_iter()
        .zip(row.positional_strings("PrefixLengths"))
        .filter(|(ip, _)| !ip.trim().is_empty())
        .collect();
    let ips: Vec<&str> = pairs.iter().map(|(ip, _)| ip.as_str()).collect();
    let subnets: Vec<String> = pairs
        .iter()
        .filter_map(|(ip, prefix)| {
            let len = prefix.trim().parse::<u8>().ok()?;
            Some(format_prefix(ip, len))
        })
        .collect();
    HostNetworkAdapterInfo {
        is_default_switch: adapter_name.eq_ignore_ascii_case(DEFAULT_SWITCH_ADAPTER),
        adapter_name,
        interface_description: row.string("InterfaceDescription"),
        ip_addresses: ips.join(", "),
        subnets: subnets.join(", "),
        gateway: row.opt_string("Gateway"),
        dns_servers: row.string_list("DnsServers"),
    }
}

/// Dotted mask for IPv4 addresses, `/len` for everything else.
pub fn format_prefix(ip: &str, prefix_len: u8) -> String {
    if ip.contains('.') && !ip.contains(':') {
        prefix_to_mask(prefix_len)
    } else {
        format!("/{}", prefix_len)
    }
}

/// IPv4 prefix length to dotted-decimal mask (`24` -> `255.255.255.0`).
pub fn prefix_to_mask(prefix_len: u8) -> String {
    let len = u32::from(prefix_len.min(32));
    let bits = if len == 0 { 0 } else { u32::MAX << (32 - len) };
    Ipv4Addr::from(bits).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn masks() {
        assert_eq!(prefix_to_mask(24), "255.255.255.0");
        assert_eq!(prefix_to_mask(20), "255.255.240.0");
        assert_eq!(prefix_to_mask(32), "255.255.255.255");
        assert_eq!(prefix_to_mask(0), "0.0.0.0");
        assert_eq!(format_prefix("fe80::1", 64), "/64");
        assert_eq!(format_prefix("10.0.0.5", 8), "255.0.0.0");
    }

    #[test]
    fn host_row_mapping() {
        let row = RowView::new(json!({
            "AdapterName": "Ethernet",
            "InterfaceDescription": "Intel(R) Ethernet",
            "Status": "Up",
            "IpAddresses": ["192.168.1.20", "fe80::2"],
            "PrefixLengths": [24, 64],
            "Gateway": "192.168.1.1",
            "DnsServers": ["192.168.1.1", "1.1.1.1"]
        }));
        assert!(has_uplink(&row));
        let info = host_adapter_from_row(&row);
        assert_eq!(info.ip_addresses, "192.168.1.20, fe80::2");
        assert_eq!(info.subnets, "255.255.255.0, /64");
        assert_eq!(info.dns_servers, "192.168.1.1, 1.1.1.1");
        assert!(info.has_gateway());
        assert!(!info.is_default_switch);
    }

    #[test]
    fn blank_address_keeps_prefixes_aligned() {
        let row = RowView::new(json!({
            "AdapterName": "Ethernet 2",
            "IpAddresses": ["", "10.0.0.5", null, "192.168.7.9"],
            "PrefixLengths": [64, 8, 24, 20]
        }));
        let info = host_adapter_from_row(&row);
        assert_eq!(info.ip_addresses, "10.0.0.5, 192.168.7.9");
        assert_eq!(info.subnets, "255.0.0.0, 255.255.240.0");
    }

    #[test]
    fn down_adapter_without_gateway_has_no_uplink() {
        let row = RowView::new(json!({"AdapterName": "Wi-Fi", "Status": "Disconnected", "Gateway": null}));
        assert!(!has_uplink(&row));
    }

    #[test]
    fn default_switch_alias_is_flagged() {
        let row = RowView::new(json!({"AdapterName": "vEthernet (default switch)", "Status": "Up"}));
        assert!(host_adapter_from_row(&row).is_default_switch);
    }
}
