mod common;

use std::fs;

use camino::Utf8PathBuf;

use alma_bulk_manager::domain::UnitIdentity;
use alma_bulk_manager::layout::{PathResolver, find_unit_dirs, identity_from_dir};

use common::{candidate, mous};

fn dest(dir: &tempfile::TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap()
}

#[test]
fn new_units_use_the_canonical_layout() {
    let dir = tempfile::tempdir().unwrap();
    let resolver = PathResolver::new(dest(&dir));
    let layout = resolver.resolve(&candidate(16).identity);
    assert!(layout.root().as_str().ends_with(
        "2019.1.00001.S/science_goal.uid___A001_X1a2_Xa0/group.uid___A001_X1a2_Xa1/member.uid___A001_X1a2_X10"
    ));
}

#[test]
fn existing_legacy_directory_is_reused_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let resolver = PathResolver::new(dest(&dir));
    let identity = candidate(16).identity;
    let legacy = resolver.legacy_path(&identity);
    fs::create_dir_all(legacy.join("delivered")).unwrap();
    fs::write(legacy.join("delivered/keep.txt"), b"x").unwrap();

    let layout = resolver.resolve(&identity);
    assert_eq!(layout.root(), legacy.as_path());
    layout.ensure().unwrap();
    assert!(legacy.join("delivered/keep.txt").is_file());
    assert!(!resolver.canonical_path(&identity).exists());
}

#[test]
fn unit_dirs_are_found_and_identified() {
    let dir = tempfile::tempdir().unwrap();
    let resolver = PathResolver::new(dest(&dir));
    for n in [16, 17] {
        resolver.resolve(&candidate(n).identity).ensure().unwrap();
    }

    let found = find_unit_dirs(&dest(&dir)).unwrap();
    assert_eq!(found.len(), 2);
    let identity = identity_from_dir(&found[0]).unwrap();
    assert_eq!(identity.mous_uid, mous(16));
    assert_eq!(identity.project_code, "2019.1.00001.S");
}

#[test]
fn legacy_directory_names_known_parents() {
    let dir = tempfile::tempdir().unwrap();
    let resolver = PathResolver::new(dest(&dir));
    let identity = candidate(16).identity;
    let legacy = dest(&dir)
        .join("science_goal_uid___A001_X1a2_Xa0")
        .join("group_obs_unit_set_uid___A001_X1a2_Xa1")
        .join("member.uid___A001_X1a2_X10");
    assert_eq!(resolver.legacy_path(&identity), legacy);

    fs::create_dir_all(&legacy).unwrap();
    assert_eq!(resolver.resolve(&identity).root(), legacy.as_path());
}

#[test]
fn legacy_directory_with_unknown_parents_is_reused() {
    let dir = tempfile::tempdir().unwrap();
    let resolver = PathResolver::new(dest(&dir));
    let identity = UnitIdentity::new("2019.1.00001.S", mous(16));
    let legacy = dest(&dir)
        .join("science_goal_unknown")
        .join("group_obs_unit_set_unknown")
        .join("member.uid___A001_X1a2_X10");
    assert_eq!(resolver.legacy_path(&identity), legacy);

    fs::create_dir_all(&legacy).unwrap();
    assert_eq!(resolver.resolve(&identity).root(), legacy.as_path());

    let found = find_unit_dirs(&dest(&dir)).unwrap();
    assert_eq!(found, vec![legacy.clone()]);
    let recovered = identity_from_dir(&legacy).unwrap();
    assert_eq!(recovered.mous_uid, mous(16));
    assert_eq!(recovered.science_goal_uid, None);
    assert_eq!(recovered.group_ous_uid, None);
}

#[test]
fn underscore_member_directories_are_units() {
    let dir = tempfile::tempdir().unwrap();
    let unit = dest(&dir).join("copied").join("member_uid___A001_X1a2_X10");
    fs::create_dir_all(&unit).unwrap();

    let found = find_unit_dirs(&dest(&dir)).unwrap();
    assert_eq!(found, vec![unit.clone()]);
    assert_eq!(identity_from_dir(&unit).unwrap().mous_uid, mous(16));
}
