//! Two devices of one account syncing the same folder

mod common;

use common::{content, second_device, setup};

#[test]
fn test_file_written_on_one_device_appears_on_the_other() {
    let (mut laptop, docs) = setup();
    let mut desktop = second_device(&laptop, docs);

    let data = content(11, 4000);
    laptop.write("/sync/shared/list.txt", &data, 300);
    laptop.settle_with(&mut desktop);

    assert_eq!(desktop.read("/sync/shared/list.txt").unwrap(), data);
}

#[test]
fn test_edit_flows_back() {
    let (mut laptop, docs) = setup();
    let mut desktop = second_device(&laptop, docs);
    laptop.write("/sync/todo.txt", b"buy milk", 300);
    laptop.settle_with(&mut desktop);

    desktop.write("/sync/todo.txt", b"buy milk and eggs", 400);
    desktop.settle_with(&mut laptop);

    assert_eq!(laptop.read("/sync/todo.txt").unwrap(), b"buy milk and eggs");
    assert_eq!(laptop.remote_file("Docs/todo.txt").unwrap(), b"buy milk and eggs");
}

#[test]
fn test_delete_on_one_device_reaches_the_other() {
    let (mut laptop, docs) = setup();
    let mut desktop = second_device(&laptop, docs);
    laptop.write("/sync/old.txt", b"obsolete", 300);
    laptop.settle_with(&mut desktop);
    assert!(desktop.read("/sync/old.txt").is_some());

    laptop.fs.remove_all(std::path::Path::new("/sync/old.txt"));
    laptop.settle_with(&mut desktop);

    assert!(desktop.read("/sync/old.txt").is_none());
    assert!(desktop.read("/sync/.debris/2024-01-15/old.txt").is_some());
}
