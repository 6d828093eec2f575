extern crate libc;

/// Apply SO_RCVBUF / SO_SNDBUF to a socket. A size of 0 leaves the OS default in place.
#[cfg(unix)]
pub fn set_socket_buffer_sizes<S: std::os::fd::AsRawFd>(
    sock: &S,
    receive_buffer_size: usize,
    send_buffer_size: usize,
) -> std::io::Result<()> {
    let fd = sock.as_raw_fd();
    if receive_buffer_size > 0 {
        set_int_option(fd, libc::SO_RCVBUF, receive_buffer_size)?;
    }
    if send_buffer_size > 0 {
        set_int_option(fd, libc::SO_SNDBUF, send_buffer_size)?;
    }
    Ok(())
}

#[cfg(unix)]
fn set_int_option(fd: libc::c_int, option: libc::c_int, value: usize) -> std::io::Result<()> {
    let value = value.min(libc::c_int::MAX as usize) as libc::c_int;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            option,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn set_socket_buffer_sizes<S>(
    _sock: &S,
    _receive_buffer_size: usize,
    _send_buffer_size: usize,
) -> std::io::Result<()> {
    Ok(())
}

/// Read back SO_RCVBUF; the kernel may round or double the requested size.
#[cfg(unix)]
pub fn receive_buffer_size<S: std::os::fd::AsRawFd>(sock: &S) -> std::io::Result<usize> {
    let mut value: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            sock.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &mut value as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(value.max(0) as usize)
}

/// Deadline helper used by tests and start-up waits.
pub struct Timer {
    deadline: std::time::Instant,
}
impl Timer {
    pub fn new_millis(millis: u64) -> Self {
        Self {
            deadline: std::time::Instant::now() + std::time::Duration::from_millis(millis),
        }
    }
    pub fn expired(&self) -> bool {
        std::time::Instant::now() >= self.deadline
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_socket_buffer_sizes() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        set_socket_buffer_sizes(&stream, 64 * 1024, 64 * 1024).unwrap();
        assert!(receive_buffer_size(&stream).unwrap() >= 64 * 1024);
    }

    #[test]
    fn test_timer() {
        let timer = Timer::new_millis(0);
        assert!(timer.expired());
        assert!(!Timer::new_millis(60_000).expired());
    }
}
