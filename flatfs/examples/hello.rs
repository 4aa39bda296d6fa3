use flatfs::StorageEngine;

pub fn main() {
    let tmp = tempfile::NamedTempFile::new().expect("Could not create backing image.");

    // Mount a fresh image, write a file and flush it.
    let mut fs = StorageEngine::open_path(tmp.path()).expect("should mount");
    fs.create("/hello.txt", 0o644).unwrap();
    fs.write("/hello.txt", b"hello, world\n", 0).unwrap();
    fs.shutdown().unwrap();

    // Mount it again and read the file back.
    let fs = StorageEngine::open_path(tmp.path()).expect("should remount");
    let mut buf = [0; 64];
    let n = fs.read("/hello.txt", &mut buf, 0).unwrap();
    print!("{}", String::from_utf8_lossy(&buf[..n]));
    println!("{:?}", fs.list("/").unwrap());
}
