use super::*;

fn fixture_paths() -> InventoryPaths {
    InventoryPaths::default()
}

fn yaml_err(hosts: &str, groups: &str, defaults: &str) -> InventoryError {
    Inventory::from_yaml(hosts, groups, defaults).unwrap_err()
}

mod platform {
    use super::*;

    #[test]
    fn from_name_accepts_long_and_short_names() {
        assert_eq!(Platform::CiscoIos, Platform::from_name("cisco_ios"));
        assert_eq!(Platform::CiscoIos, Platform::from_name("IOS"));
        assert_eq!(Platform::CiscoAsa, Platform::from_name(" asa "));
    }

    #[test]
    fn unknown_names_are_kept() {
        let platform = Platform::from_name(" juniper_junos ");
        assert_eq!(Platform::Other("juniper_junos".to_owned()), platform);
        assert_eq!("juniper_junos", platform.name());
        assert_eq!(None, platform.backup_command());
        assert_eq!(None, platform.disable_paging());
    }

    #[test]
    fn backup_command() {
        assert_eq!(Some("more system:running-config"), Platform::CiscoAsa.backup_command());
        assert_eq!(Some("terminal pager 0"), Platform::CiscoAsa.disable_paging());
        for platform in [
            Platform::CiscoIos,
            Platform::CiscoXe,
            Platform::CiscoNxos,
            Platform::CiscoXr,
        ] {
            assert_eq!(Some("show running-config"), platform.backup_command());
            assert_eq!(Some("terminal length 0"), platform.disable_paging());
        }
    }

    #[test]
    fn names_round_trip() {
        for (_, platform) in PLATFORM_NAMES {
            assert_eq!(*platform, Platform::from_name(platform.name()));
        }
    }
}

mod load {
    use super::*;

    #[test]
    fn resolves_fixture_inventory() {
        let inventory = Inventory::load(&fixture_paths()).unwrap();
        let names: Vec<_> = inventory.devices().iter().map(|d| d.name.as_str()).collect();
        assert_eq!(vec!["core-sw1", "edge-fw1", "dc-nx1"], names);
    }

    #[test]
    fn inherits_from_groups_and_defaults() {
        let inventory = Inventory::load(&fixture_paths()).unwrap();

        let core = inventory.get("core-sw1").unwrap();
        assert_eq!("10.0.0.1", core.address);
        assert_eq!(Some(Platform::CiscoIos), core.platform);
        assert_eq!(DEFAULT_PORT, core.port);
        assert_eq!(Some(&Value::from("hq")), core.data.get("site"));
        assert_eq!(Some(&Value::from("network")), core.data.get("role"));
        assert_eq!(Some("show running-config"), core.backup_command());
        assert_eq!(None, core.http_management_port());
    }

    #[test]
    fn keeps_default_credentials_apart() {
        let inventory = Inventory::load(&fixture_paths()).unwrap();

        let core = inventory.get("core-sw1").unwrap();
        assert_eq!(
            CredentialMaterial {
                username: None,
                password: None,
                secret: Some("group-enable".to_owned()),
            },
            core.credentials.assigned,
        );
        assert_eq!(Some("backup"), core.credentials.defaults.username.as_deref());
        assert_eq!(None, core.credentials.defaults.password);
    }

    #[test]
    fn host_values_win() {
        let inventory = Inventory::load(&fixture_paths()).unwrap();

        let firewall = inventory.get("edge-fw1").unwrap();
        assert_eq!(Some(Platform::CiscoAsa), firewall.platform);
        assert_eq!(2222, firewall.port);
        assert_eq!(Some("fwadmin"), firewall.credentials.assigned.username.as_deref());
        assert_eq!(Some("fw-secret"), firewall.credentials.assigned.password.as_deref());
        assert_eq!(Some("backup"), firewall.credentials.defaults.username.as_deref());
        assert_eq!(Some(&Value::from("unknown")), firewall.data.get("site"));
        assert_eq!(Some("more system:running-config"), firewall.backup_command());
        assert_eq!(Some(DEFAULT_HTTP_PORT), firewall.http_management_port());
    }

    #[test]
    fn nearer_group_wins_over_parent() {
        let inventory = Inventory::load(&fixture_paths()).unwrap();
        let nexus = inventory.get("dc-nx1").unwrap();
        assert_eq!(Some(Platform::CiscoNxos), nexus.platform);
        assert_eq!(Some("show running-config all"), nexus.backup_command());
    }

    #[test]
    fn missing_hosts_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let paths = InventoryPaths {
            hosts: dir.path().join("hosts.yaml"),
            ..Default::default()
        };
        assert!(matches!(
            Inventory::load(&paths),
            Err(InventoryError::Io { .. }),
        ));
    }

    #[test]
    fn groups_and_defaults_are_optional() {
        let dir = tempfile::tempdir().unwrap();
        let hosts = dir.path().join("hosts.yaml");
        fs::write(&hosts, "r1:\n  platform: cisco_xe\n").unwrap();
        let inventory = Inventory::load(&InventoryPaths {
            hosts,
            groups: None,
            defaults: None,
        })
        .unwrap();
        assert_eq!("r1", inventory.devices()[0].address);
    }
}

mod from_yaml {
    use super::*;

    #[test]
    fn empty_files_are_an_empty_inventory() {
        let inventory = Inventory::from_yaml("", "", "").unwrap();
        assert!(inventory.is_empty());

        let inventory = Inventory::from_yaml("# nothing yet\n", "", "").unwrap();
        assert!(inventory.is_empty());
    }

    #[test]
    fn missing_platform_still_loads() {
        let inventory = Inventory::from_yaml("r1:\n  hostname: 10.0.0.1\n", "", "").unwrap();
        let device = &inventory.devices()[0];
        assert_eq!(None, device.platform);
        assert_eq!("unset", device.platform_name());
        assert_eq!(None, device.backup_command());
    }

    #[test]
    fn unknown_platform_with_backup_command_loads() {
        let hosts = "r1: {platform: cisco_ios}\n\
                     j1: {platform: juniper_junos, data: {backup_command: show configuration}}\n\
                     j2: {platform: juniper_junos}\n";
        let inventory = Inventory::from_yaml(hosts, "", "").unwrap();
        assert_eq!(3, inventory.len());

        let junos = inventory.get("j1").unwrap();
        assert_eq!(Some(Platform::Other("juniper_junos".to_owned())), junos.platform);
        assert_eq!(Some("show configuration"), junos.backup_command());

        // Loads, but can't be backed up.
        assert_eq!(None, inventory.get("j2").unwrap().backup_command());
    }

    #[test]
    fn http_management_is_asa_only() {
        let hosts = "fw1: {platform: asa, data: {http_management: true, http_mgmt_port: 443}}\n\
                     fw2: {platform: asa, data: {http_management: false}}\n\
                     r1: {platform: ios, data: {http_management: true}}\n";
        let inventory = Inventory::from_yaml(hosts, "", "").unwrap();
        assert_eq!(Some(443), inventory.get("fw1").unwrap().http_management_port());
        assert_eq!(None, inventory.get("fw2").unwrap().http_management_port());
        assert_eq!(None, inventory.get("r1").unwrap().http_management_port());
    }

    #[test]
    fn unknown_group() {
        let err = yaml_err("r1:\n  groups: [nope]\n", "", "platform: ios\n");
        assert!(matches!(
            err,
            InventoryError::UnknownGroup { ref member, ref group } if member == "r1" && group == "nope"
        ));
    }

    #[test]
    fn group_cycle() {
        let groups = "a:\n  groups: [b]\nb:\n  groups: [a]\n";
        let err = yaml_err("r1:\n  groups: [a]\n", groups, "platform: ios\n");
        assert!(matches!(err, InventoryError::GroupCycle(_)));
    }

    #[test]
    fn shared_parent_group_is_not_a_cycle() {
        let groups = "a:\n  groups: [base]\nb:\n  groups: [base]\nbase:\n  platform: ios\n";
        let inventory = Inventory::from_yaml("r1:\n  groups: [a, b]\n", groups, "").unwrap();
        assert_eq!(Some(Platform::CiscoIos), inventory.devices()[0].platform);
    }

    #[test]
    fn rejects_unsafe_names() {
        let err = yaml_err("../etc/passwd:\n  platform: ios\n", "", "");
        assert!(matches!(err, InventoryError::InvalidName(_)));
    }

    #[test]
    fn parse_error_names_the_file() {
        let err = yaml_err("r1: [unclosed\n", "", "");
        match err {
            InventoryError::Parse { path, .. } => assert_eq!(Path::new("hosts.yaml"), path),
            err => panic!("expected a parse error, got {err:?}"),
        }
    }
}

mod new {
    use super::*;

    #[test]
    fn rejects_duplicates() {
        let err = Inventory::new(vec![
            Device::new("r1", "10.0.0.1", Platform::CiscoIos),
            Device::new("r1", "10.0.0.2", Platform::CiscoIos),
        ])
        .unwrap_err();
        assert!(matches!(err, InventoryError::DuplicateHost(name) if name == "r1"));
    }
}

mod filter_addresses {
    use super::*;

    fn inventory() -> Inventory {
        Inventory::new(vec![
            Device::new("r1", "10.0.0.1", Platform::CiscoIos),
            Device::new("r2", "10.0.0.2", Platform::CiscoIos),
            Device::new("r3", "10.0.0.3", Platform::CiscoIos),
        ])
        .unwrap()
    }

    #[test]
    fn works() {
        let filtered =
            inventory().filter_addresses(&["10.0.0.3".to_owned(), " 10.0.0.1 ".to_owned()]);
        let names: Vec<_> = filtered.devices().iter().map(|d| d.name.as_str()).collect();
        assert_eq!(vec!["r1", "r3"], names);
    }

    #[test]
    fn empty_filter_keeps_everything() {
        assert_eq!(3, inventory().filter_addresses(&[]).len());
    }
}
