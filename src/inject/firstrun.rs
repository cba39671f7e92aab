//! First-boot script
//!
//! `firstrun.sh` copies the staged files into the root filesystem on the
//! first boot, then removes its own kernel command line hook.

use std::path::Path;

use super::files::{apply_cmdline, write_atomic, STAGING_DIR};
use super::DomainError;
use crate::settings::SettingsDomain;

pub const FIRSTRUN_SCRIPT: &str = "firstrun.sh";

/// Where the boot partition is mounted on the running target
const TARGET_BOOT_DIR: &str = "/boot/firmware";

fn cmdline_hook() -> Vec<String> {
    vec![
        format!("systemd.run={}/{}", TARGET_BOOT_DIR, FIRSTRUN_SCRIPT),
        "systemd.run_success_action=reboot".to_string(),
        "systemd.unit=kernel-command-line.target".to_string(),
    ]
}

pub(super) fn apply(boot: &Path, applied: &[SettingsDomain]) -> Result<(), DomainError> {
    write_atomic(&boot.join(FIRSTRUN_SCRIPT), &render_script(applied))?;
    apply_cmdline(boot, &cmdline_hook())
}

fn render_script(applied: &[SettingsDomain]) -> String {
    let has = |d: SettingsDomain| applied.contains(&d);
    let mut s = String::new();

    s.push_str("#!/bin/bash\nset +e\n\n");
    s.push_str("BOOT=\"$(cd \"$(dirname \"$0\")\" && pwd)\"\n");
    s.push_str(&format!("STAGE=\"$BOOT/{}\"\n\n", STAGING_DIR));

    if has(SettingsDomain::Scripts) {
        s.push_str("[ -f \"$STAGE/scripts/pre.sh\" ] && bash \"$STAGE/scripts/pre.sh\"\n\n");
    }

    if has(SettingsDomain::System) {
        s.push_str(
            r#"if [ -f "$STAGE/system.conf" ]; then
  . "$STAGE/system.conf"
  if [ -n "$hostname" ]; then
    CURRENT="$(cat /etc/hostname)"
    echo "$hostname" > /etc/hostname
    sed -i "s/127.0.1.1.*$CURRENT/127.0.1.1\t$hostname/g" /etc/hosts
  fi
  [ -n "$locale" ] && localectl set-locale "LANG=$locale"
  [ -n "$timezone" ] && timedatectl set-timezone "$timezone"
  [ -n "$keymap" ] && localectl set-x11-keymap "$keymap"
fi

"#,
        );
    }

    if has(SettingsDomain::Users) {
        s.push_str(
            r#"if [ -f "$STAGE/users.conf" ]; then
  while IFS=: read -r NAME HASH SUDO EXTRA_GROUPS; do
    id "$NAME" >/dev/null 2>&1 || useradd -m -s /bin/bash "$NAME"
    usermod -p "$HASH" "$NAME"
    [ "$SUDO" = "1" ] && usermod -aG sudo "$NAME"
    [ -n "$EXTRA_GROUPS" ] && usermod -aG "$EXTRA_GROUPS" "$NAME"
  done < "$STAGE/users.conf"
fi

"#,
        );
    }

    if has(SettingsDomain::Ssh) {
        s.push_str(
            r#"if [ -f "$STAGE/ssh/sshd_config" ]; then
  install -m 644 "$STAGE/ssh/sshd_config" /etc/ssh/sshd_config.d/flashkit.conf
fi
if [ -f "$STAGE/ssh/authorized_keys" ]; then
  for HOME_DIR in /root $(awk -F: '$3 >= 1000 && $3 < 65534 {print $6}' /etc/passwd); do
    install -d -m 700 "$HOME_DIR/.ssh"
    install -m 600 "$STAGE/ssh/authorized_keys" "$HOME_DIR/.ssh/authorized_keys"
    chown -R "$(stat -c %U "$HOME_DIR")": "$HOME_DIR/.ssh"
  done
fi
[ -f "$BOOT/ssh" ] && systemctl enable ssh

"#,
        );
    }

    if has(SettingsDomain::Network) {
        s.push_str(
            r#"if [ -d "$STAGE/network" ]; then
  for CONN in "$STAGE"/network/*.nmconnection; do
    [ -f "$CONN" ] || continue
    install -m 600 "$CONN" /etc/NetworkManager/system-connections/
  done
  [ -f "$STAGE/network/country" ] && iw reg set "$(cat "$STAGE/network/country")"
  rfkill unblock wifi
fi

"#,
        );
    }

    if has(SettingsDomain::Packages) {
        s.push_str(
            r#"if [ -f "$STAGE/packages.conf" ]; then
  . "$STAGE/packages.conf"
  [ "$UPDATE" = "yes" ] && apt-get update
  [ "$UPGRADE" = "yes" ] && DEBIAN_FRONTEND=noninteractive apt-get -y upgrade
  [ -n "$INSTALL" ] && DEBIAN_FRONTEND=noninteractive apt-get -y install $INSTALL
fi

"#,
        );
    }

    if has(SettingsDomain::Scripts) {
        s.push_str("[ -f \"$STAGE/scripts/firstboot.sh\" ] && bash \"$STAGE/scripts/firstboot.sh\"\n");
        s.push_str("[ -f \"$STAGE/scripts/post.sh\" ] && bash \"$STAGE/scripts/post.sh\"\n\n");
    }

    s.push_str(
        r#"rm -rf "$STAGE" "$BOOT/userconf.txt"
sed -i 's| systemd.run.*||g' "$BOOT/cmdline.txt"
rm -f "$0"
exit 0
"#,
    );
    s
}
