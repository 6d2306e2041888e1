//! The first user program: exercises the syscall surface end to end, then
//! powers down by exiting.

#![no_std]
#![no_main]

use ktos_user::{IoctlCmd, syscall};

extern crate ktos_user;

#[unsafe(no_mangle)]
extern "C" fn main(_argc: usize, _argv: *const *const u8) -> isize {
    let _ = syscall::print("init starting");

    file_demo();
    pipe_demo();
    exec_demo();

    let _ = syscall::print("init done");
    0
}

/// create / resize / write / read / delete round trip.
fn file_demo() {
    if syscall::fscreate("scratch").is_err() {
        let _ = syscall::print("file: create failed");
        return;
    }
    let Ok(fd) = syscall::fsopen(-1, "scratch") else {
        let _ = syscall::print("file: open failed");
        return;
    };

    let mut len = 3;
    let _ = syscall::ioctl(fd, IoctlCmd::SetEnd, &mut len);
    let _ = syscall::write(fd, b"wow");

    let mut pos = 0;
    let _ = syscall::ioctl(fd, IoctlCmd::SetPos, &mut pos);
    let mut buf = [0_u8; 3];
    match syscall::read(fd, &mut buf) {
        Ok(3) if &buf == b"wow" => {
            let _ = syscall::print("file: ok");
        }
        _ => {
            let _ = syscall::print("file: bad contents");
        }
    }

    let _ = syscall::close(fd);
    let _ = syscall::fsdelete("scratch");
    if syscall::fsopen(-1, "scratch").is_ok() {
        let _ = syscall::print("file: delete did not stick");
    }
}

/// fork a child that writes into a pipe; read it back and see EOF.
fn pipe_demo() {
    let Ok((wfd, rfd)) = syscall::pipe(-1, -1) else {
        let _ = syscall::print("pipe: create failed");
        return;
    };

    match syscall::fork() {
        Ok(0) => {
            // child: write and exit; exiting closes our pipe ends
            let _ = syscall::close(rfd);
            let _ = syscall::write(wfd, b"hello");
            syscall::exit();
        }
        Ok(child) => {
            let _ = syscall::close(wfd);
            let mut buf = [0_u8; 16];
            let got = syscall::read(rfd, &mut buf);
            let eof = syscall::read(rfd, &mut buf);
            match (got, eof) {
                (Ok(5), Ok(0)) if &buf[..5] == b"hello" => {
                    let _ = syscall::print("pipe: ok");
                }
                _ => {
                    let _ = syscall::print("pipe: bad transfer");
                }
            }
            let _ = syscall::close(rfd);
            let _ = syscall::wait(child);
        }
        Err(_) => {
            let _ = syscall::print("pipe: fork failed");
        }
    }
}

/// fork + exec the hello program and wait for it.
fn exec_demo() {
    let Ok(fd) = syscall::fsopen(-1, "hello") else {
        let _ = syscall::print("exec: no hello image");
        return;
    };
    match syscall::fork() {
        Ok(0) => {
            let _ = syscall::exec(fd, &[b"hello"]);
            let _ = syscall::print("exec: failed");
            syscall::exit();
        }
        Ok(child) => {
            let _ = syscall::close(fd);
            let _ = syscall::wait(child);
        }
        Err(_) => {
            let _ = syscall::print("exec: fork failed");
        }
    }
}
